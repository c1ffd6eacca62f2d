//! Communication channels (LINE, Telegram).
//!
//! Each channel normalizes platform payloads into [`InboundEvent`]s and answers them through
//! [`ChannelHandle::reply`]. The registry lets the emitter and router find a channel by id.

mod inbound;
pub mod line;
mod registry;
pub mod telegram;

pub use inbound::{EventPayload, InboundEvent, MessageKind, NormalizeError, ReplyHandle};
pub use line::LineChannel;
pub use registry::{truncate_chars, ChannelError, ChannelHandle, ChannelRegistry};
pub use telegram::{TelegramChannel, TelegramUpdate};
