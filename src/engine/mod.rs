// Session engine - independent of the command line

pub mod component;
pub mod core;
pub mod exchange;
pub mod feed;
pub mod lifecycle;
pub mod osal;
pub mod pacer;
pub mod queue;
pub mod session;
pub mod sim;
pub mod source;
pub mod worker;

pub use component::{Command, Component, ComponentCallbacks, ComponentEvent, Param, ParamIndex};
pub use core::*;
pub use session::{CodecSettings, OverlayConfig, Session, SessionConfig};
pub use worker::{SessionMessage, SessionPool};
