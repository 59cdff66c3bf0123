//! Dispatch router: applies gateway events to the per-server caches.

use std::collections::HashMap;

use tracing::{debug, trace};

use chorus_protocol::gateway::{Channel, DispatchEvent, Guild, Message, User};

/// Messages retained per channel.
const MESSAGE_CACHE_LIMIT: usize = 100;

/// Cached view of one server, seeded by READY and kept current by the
/// dispatch stream.
#[derive(Default)]
pub struct ClientState {
    pub session_id: Option<String>,
    pub current_user: Option<User>,
    pub guilds: HashMap<String, Guild>,
    pub channels: HashMap<String, Channel>,
    /// guild id → member user ids → user
    pub members: HashMap<String, HashMap<String, User>>,
    /// user id → presence status
    pub presences: HashMap<String, String>,
    /// user id → voice channel (None = left voice)
    pub voice_states: HashMap<String, Option<String>>,
    /// channel id → recent messages, oldest first
    pub messages: HashMap<String, Vec<Message>>,
    /// user id → relationship kind
    pub relationships: HashMap<String, String>,
    /// Set when the server announced an imminent restart.
    pub restart_pending: bool,
}

impl ClientState {
    /// Total router over the dispatch stream. Unknown events are logged and
    /// dropped; nothing here fails.
    pub fn apply(&mut self, event: &DispatchEvent) {
        match event {
            DispatchEvent::Ready(ready) => {
                if self.restart_pending {
                    debug!(session = ?self.session_id, "Reconnected after server restart");
                }
                self.session_id = Some(ready.session_id.clone());
                self.current_user = Some(ready.user.clone());
                for guild in &ready.guilds {
                    self.guilds.insert(guild.id.clone(), guild.clone());
                }
                self.restart_pending = false;
            }
            DispatchEvent::MessageCreate(message) => {
                let bucket = self.messages.entry(message.channel_id.clone()).or_default();
                bucket.push(message.clone());
                if bucket.len() > MESSAGE_CACHE_LIMIT {
                    let excess = bucket.len() - MESSAGE_CACHE_LIMIT;
                    bucket.drain(..excess);
                }
            }
            DispatchEvent::MessageUpdate(message) => {
                if let Some(bucket) = self.messages.get_mut(&message.channel_id)
                    && let Some(cached) = bucket.iter_mut().find(|m| m.id == message.id)
                {
                    *cached = message.clone();
                }
            }
            DispatchEvent::MessageDelete(delete) => {
                if let Some(bucket) = self.messages.get_mut(&delete.channel_id) {
                    bucket.retain(|m| m.id != delete.id);
                }
            }
            DispatchEvent::MessageDeleteBulk(bulk) => {
                if let Some(bucket) = self.messages.get_mut(&bulk.channel_id) {
                    bucket.retain(|m| !bulk.ids.contains(&m.id));
                }
            }
            DispatchEvent::GuildCreate(guild) | DispatchEvent::GuildUpdate(guild) => {
                self.guilds.insert(guild.id.clone(), guild.clone());
            }
            DispatchEvent::GuildDelete(delete) => {
                self.guilds.remove(&delete.id);
                self.members.remove(&delete.id);
                self.channels.retain(|_, c| c.guild_id.as_deref() != Some(&delete.id));
            }
            DispatchEvent::ChannelCreate(channel) | DispatchEvent::ChannelUpdate(channel) => {
                self.channels.insert(channel.id.clone(), channel.clone());
            }
            DispatchEvent::ChannelDelete(delete) => {
                self.channels.remove(&delete.id);
                self.messages.remove(&delete.id);
            }
            DispatchEvent::GuildMemberAdd(member) | DispatchEvent::GuildMemberUpdate(member) => {
                if let Some(guild_id) = &member.guild_id {
                    self.members
                        .entry(guild_id.clone())
                        .or_default()
                        .insert(member.user.id.clone(), member.user.clone());
                }
            }
            DispatchEvent::GuildMemberRemove(member) => {
                if let Some(guild_id) = &member.guild_id
                    && let Some(roster) = self.members.get_mut(guild_id)
                {
                    roster.remove(&member.user.id);
                }
            }
            DispatchEvent::PresenceUpdate(presence) => {
                self.presences
                    .insert(presence.user_id.clone(), presence.status.clone());
            }
            DispatchEvent::VoiceStateUpdate(voice) => {
                self.voice_states
                    .insert(voice.user_id.clone(), voice.channel_id.clone());
            }
            DispatchEvent::MessageReactionAdd(reaction)
            | DispatchEvent::MessageReactionRemove(reaction) => {
                trace!(message = reaction.message_id, "Reaction change");
            }
            DispatchEvent::ChannelPinsUpdate(pins) => {
                trace!(channel = pins.channel_id, "Pins changed");
            }
            DispatchEvent::TypingStart(typing) => {
                trace!(channel = typing.channel_id, user = typing.user_id, "Typing");
            }
            DispatchEvent::UserUpdate(user) => {
                if self.current_user.as_ref().is_some_and(|u| u.id == user.id) {
                    self.current_user = Some(user.clone());
                }
            }
            DispatchEvent::RelationshipAdd(rel) => {
                self.relationships.insert(
                    rel.user_id.clone(),
                    rel.kind.clone().unwrap_or_else(|| "friend".to_string()),
                );
            }
            DispatchEvent::RelationshipRemove(rel) => {
                self.relationships.remove(&rel.user_id);
            }
            DispatchEvent::ServerRestart => {
                self.restart_pending = true;
            }
            DispatchEvent::Unknown(name) => {
                debug!(event = name, "Dropping unknown dispatch event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(state: &mut ClientState, name: &str, d: serde_json::Value) {
        let event = DispatchEvent::parse(name, d).expect("well-formed test payload");
        state.apply(&event);
    }

    #[test]
    fn ready_seeds_session_and_guilds() {
        let mut state = ClientState::default();
        apply(
            &mut state,
            "READY",
            json!({
                "session_id": "s1",
                "user": { "id": "me", "username": "ada" },
                "guilds": [{ "id": "g1", "name": "main" }, { "id": "g2", "name": "dev" }],
            }),
        );
        assert_eq!(state.session_id.as_deref(), Some("s1"));
        assert_eq!(state.current_user.as_ref().unwrap().username, "ada");
        assert_eq!(state.guilds.len(), 2);
    }

    #[test]
    fn message_lifecycle() {
        let mut state = ClientState::default();
        apply(&mut state, "MESSAGE_CREATE", json!({"id": "m1", "channel_id": "c1", "content": "hi"}));
        apply(&mut state, "MESSAGE_CREATE", json!({"id": "m2", "channel_id": "c1", "content": "yo"}));
        apply(&mut state, "MESSAGE_UPDATE", json!({"id": "m1", "channel_id": "c1", "content": "edited"}));
        assert_eq!(state.messages["c1"][0].content, "edited");

        apply(&mut state, "MESSAGE_DELETE", json!({"id": "m1", "channel_id": "c1"}));
        assert_eq!(state.messages["c1"].len(), 1);

        apply(&mut state, "MESSAGE_DELETE_BULK", json!({"ids": ["m2"], "channel_id": "c1"}));
        assert!(state.messages["c1"].is_empty());
    }

    #[test]
    fn message_cache_is_bounded() {
        let mut state = ClientState::default();
        for i in 0..150 {
            apply(
                &mut state,
                "MESSAGE_CREATE",
                json!({"id": format!("m{i}"), "channel_id": "c1", "content": ""}),
            );
        }
        let bucket = &state.messages["c1"];
        assert_eq!(bucket.len(), MESSAGE_CACHE_LIMIT);
        assert_eq!(bucket[0].id, "m50", "oldest messages evicted first");
    }

    #[test]
    fn guild_delete_cascades() {
        let mut state = ClientState::default();
        apply(&mut state, "GUILD_CREATE", json!({"id": "g1", "name": "main"}));
        apply(&mut state, "CHANNEL_CREATE", json!({"id": "c1", "guild_id": "g1", "name": "general"}));
        apply(&mut state, "GUILD_MEMBER_ADD", json!({"guild_id": "g1", "user": {"id": "u1"}}));
        apply(&mut state, "GUILD_DELETE", json!({"id": "g1"}));
        assert!(state.guilds.is_empty());
        assert!(state.channels.is_empty());
        assert!(state.members.is_empty());
    }

    #[test]
    fn member_and_presence_tracking() {
        let mut state = ClientState::default();
        apply(&mut state, "GUILD_MEMBER_ADD", json!({"guild_id": "g1", "user": {"id": "u1", "username": "bo"}}));
        assert!(state.members["g1"].contains_key("u1"));
        apply(&mut state, "PRESENCE_UPDATE", json!({"user_id": "u1", "status": "online"}));
        assert_eq!(state.presences["u1"], "online");
        apply(&mut state, "GUILD_MEMBER_REMOVE", json!({"guild_id": "g1", "user": {"id": "u1"}}));
        assert!(!state.members["g1"].contains_key("u1"));
    }

    #[test]
    fn voice_state_join_and_leave() {
        let mut state = ClientState::default();
        apply(&mut state, "VOICE_STATE_UPDATE", json!({"user_id": "u1", "channel_id": "vc1"}));
        assert_eq!(state.voice_states["u1"].as_deref(), Some("vc1"));
        apply(&mut state, "VOICE_STATE_UPDATE", json!({"user_id": "u1", "channel_id": null}));
        assert_eq!(state.voice_states["u1"], None);
    }

    #[test]
    fn relationships_add_and_remove() {
        let mut state = ClientState::default();
        apply(&mut state, "RELATIONSHIP_ADD", json!({"user_id": "u9", "type": "blocked"}));
        assert_eq!(state.relationships["u9"], "blocked");
        apply(&mut state, "RELATIONSHIP_REMOVE", json!({"user_id": "u9"}));
        assert!(state.relationships.is_empty());
    }

    #[test]
    fn unknown_event_changes_nothing() {
        let mut state = ClientState::default();
        state.apply(&DispatchEvent::Unknown("SOMETHING_NEW".into()));
        assert!(state.guilds.is_empty());
        assert!(state.session_id.is_none());
    }

    #[test]
    fn server_restart_flags_state() {
        let mut state = ClientState::default();
        state.apply(&DispatchEvent::ServerRestart);
        assert!(state.restart_pending);
    }
}
