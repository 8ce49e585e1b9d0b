//! Queue scheduling and playback engine for party karaoke rooms.
//!
//! Participants submit songs to a shared per-room queue, a display client
//! polls for the entry on screen, and the [Scheduler] decides who sings next,
//! fairly or in arrival order, healing the room on every call.

mod config;
mod db;
mod events;
mod playback;
mod queues;
mod scheduler;

pub use config::*;
pub use db::*;
pub use events::*;
pub use playback::*;
pub use queues::*;
pub use scheduler::*;
