//! Kedge core types – message envelope, resource paths, typed payloads

#![forbid(unsafe_code)]

pub mod constants;
pub mod message;
pub mod payload;
pub mod resource;

pub use message::{Message, MessageHeader, MessageRoute, Operation};
pub use payload::ContentError;
pub use resource::{PathError, ResourceRef};

pub mod prelude {
    pub use super::constants::*;
    pub use super::message::{now_millis, Message, MessageHeader, MessageRoute, Operation};
    pub use super::payload::{ContentError, ExtendResource, NodeStatusRequest, PodStatusRequest};
    pub use super::resource::{self, PathError, ResourceRef};
}
