use serde_json::Value as JsonValue;

use crate::test_json;

/// Test events that can be added to the state.
pub enum StateTestEvent {
    Create,
    Encryption,
    Member,
    MemberAdditional,
    MemberLeave,
    PowerLevels,
    RoomName,
    RoomTopic,
    Custom(JsonValue),
}

impl From<StateTestEvent> for JsonValue {
    fn from(val: StateTestEvent) -> Self {
        match val {
            StateTestEvent::Create => test_json::sync_events::CREATE.to_owned(),
            StateTestEvent::Encryption => test_json::sync_events::ENCRYPTION.to_owned(),
            StateTestEvent::Member => test_json::sync_events::MEMBER.to_owned(),
            StateTestEvent::MemberAdditional => {
                test_json::sync_events::MEMBER_ADDITIONAL.to_owned()
            }
            StateTestEvent::MemberLeave => test_json::sync_events::MEMBER_LEAVE.to_owned(),
            StateTestEvent::PowerLevels => test_json::sync_events::POWER_LEVELS.to_owned(),
            StateTestEvent::RoomName => test_json::sync_events::NAME.to_owned(),
            StateTestEvent::RoomTopic => test_json::sync_events::TOPIC.to_owned(),
            StateTestEvent::Custom(json) => json,
        }
    }
}

/// Test events that can be added to the stripped state.
pub enum StrippedStateTestEvent {
    Member,
    RoomName,
    Custom(JsonValue),
}

impl From<StrippedStateTestEvent> for JsonValue {
    fn from(val: StrippedStateTestEvent) -> Self {
        match val {
            StrippedStateTestEvent::Member => test_json::sync_events::MEMBER_STRIPPED.to_owned(),
            StrippedStateTestEvent::RoomName => test_json::sync_events::NAME_STRIPPED.to_owned(),
            StrippedStateTestEvent::Custom(json) => json,
        }
    }
}
