//! FCP-style control surface: the line-oriented key/value request/reply
//! contract, leaving the framed transport out of scope.
//! [`frame::Frame`] is the message shape;
//! [`dispatcher::Dispatcher`] maps commands onto the engine.

pub mod dispatcher;
pub mod frame;

pub use dispatcher::{Dispatcher, FrameSink};
pub use frame::Frame;
