//! Cadenza Core - Per-guild playback lifecycle
//!
//! This crate provides the playback controller that sits between a guild's
//! queue and its voice connection: live-stream waiting, stream resolution,
//! retry and skip policy, loop handling and idle disconnects. Everything
//! platform-specific (the queue store, the resolver, the voice transport,
//! the text surface) is reached through the port traits re-exported here.

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
mod idle;
pub mod live;
pub mod notify;
pub mod queue;
pub mod resolver;
pub mod source;
pub mod voice;

#[cfg( test )]
mod testing;

pub use config::PlaybackConfig;
pub use controller::{ PlaybackController, PlaybackPhase, RetryState };
pub use engine::{ AudioPlayer, AudioResource, PlaybackEngine, PlayerState, PlayerStatus, StatusReporter, VolumeHandle };
pub use error::{ NotifyError, PlaybackError };
pub use events::{ EventBus, PlaybackEvent };
pub use live::{ LiveWaitCoordinator, LiveWaitOutcome };
pub use notify::{ Notification, NotificationPort, NowPlaying };
pub use queue::{ PlayQueue, QueuePort };
pub use resolver::{ AudioStream, ContainerType, ResolveOptions, ResolvedStream, SignalStream, StreamResolver };
pub use source::{ AudioSource, QueueItem };
pub use voice::VoiceConnection;
