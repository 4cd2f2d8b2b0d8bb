//! Voice connection port.

use std::sync::Arc;

use crate::engine::AudioPlayer;


/// A guild's voice-channel connection, managed by the host.
pub trait VoiceConnection: Send + Sync {
    /// True once the connection is established and can carry audio.
    fn is_ready( &self ) -> bool;

    /// Identifier of the connected channel, for logs.
    fn channel_id( &self ) -> String;

    /// Channel bitrate in bits per second.
    fn bitrate( &self ) -> u32;

    /// Creates an audio player subscribed to this connection.
    fn create_player( &self ) -> Arc<dyn AudioPlayer>;

    /// Leaves the channel and releases the connection.
    fn disconnect( &self );
}
