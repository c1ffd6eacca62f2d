//! Relay core library: webhook normalization, persona routing, model selection and reply
//! delivery, used by the `relay` binary.

pub mod channels;
pub mod config;
pub mod emitter;
pub mod gateway;
pub mod llm;
pub mod persona;
pub mod router;
pub mod selection;
pub mod session;
