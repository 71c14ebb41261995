//! Shared data model for the gateway: remote entities, typed remote events,
//! timestamps, and the persisted status record.

pub mod diff;
pub mod events;
pub mod models;
pub mod timestamp;

pub use diff::seddiff;
pub use events::{
    BotMessage, FileShared, Membership, Message, MessageBody, MessageDelete, MessageEdit,
    RemoteEvent, TopicChange,
};
pub use models::{
    Channel, ChannelKind, File, Im, LoginInfo, Profile, SavedStatus, SelfInfo, Team, Topic, User,
};
pub use timestamp::Timestamp;
