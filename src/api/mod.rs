//! REST collaborators: message log and profile lookup

pub mod client;
pub mod messages;
pub mod profiles;

pub use client::RestClient;
pub use messages::{InMemoryMessageLog, MessageLog, RestMessageLog};
pub use profiles::{display_name_or_fallback, ProfileLookup, RestProfiles, StaticProfiles};
