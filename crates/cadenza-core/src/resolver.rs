//! Stream resolution port.
//!
//! Turning a source descriptor into playable bytes (fetching, demuxing,
//! transcoding, normalisation) happens outside this crate. The controller
//! only sees the resulting handle, its framing and its cost.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use async_trait::async_trait;
use futures::future::{ self, BoxFuture, FutureExt };
use tokio::sync::watch;

use crate::error::PlaybackError;
use crate::source::AudioSource;


/// Wire framing of a resolved stream.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum ContainerType {
    WebmOpus,
    OggOpus,
    Raw,
    Opus,
    Arbitrary,
}


impl ContainerType {
    pub fn as_str( &self ) -> &'static str {
        match self {
            Self::WebmOpus => "webm/opus",
            Self::OggOpus => "ogg/opus",
            Self::Raw => "raw",
            Self::Opus => "opus",
            Self::Arbitrary => "arbitrary",
        }
    }


    /// Whether the player can consume the stream without transcoding.
    pub fn is_passthrough( &self ) -> bool {
        !matches!( self, Self::Arbitrary )
    }
}


impl fmt::Display for ContainerType {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.write_str( self.as_str() )
    }
}


impl FromStr for ContainerType {
    type Err = std::convert::Infallible;

    /// Unknown framings fall back to `Arbitrary`.
    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        Ok( match s.trim().to_ascii_lowercase().as_str() {
            "webm/opus" => Self::WebmOpus,
            "ogg/opus" => Self::OggOpus,
            "raw" => Self::Raw,
            "opus" => Self::Opus,
            _ => Self::Arbitrary,
        })
    }
}


/// Options handed to the resolver for one play attempt.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct ResolveOptions {
    /// ffmpeg-style audio filter arguments
    pub effect_args: Vec<String>,
    pub seek_seconds: u64,
    pub volume_transform_enabled: bool,
    /// Target bitrate of the voice channel, bits per second
    pub bitrate: u32,
}


/// A readable audio stream owned by the controller for one session.
pub trait AudioStream: Send + Sync {
    /// Resolves when the stream has delivered its last byte.
    ///
    /// Never resolves for a stream that was destroyed early.
    fn finished( &self ) -> BoxFuture<'static, ()>;

    /// Tears the stream down. Must be idempotent.
    fn destroy( &self );

    fn is_destroyed( &self ) -> bool;
}


/// Output of a successful resolution.
#[derive( Clone )]
pub struct ResolvedStream {
    pub stream: Arc<dyn AudioStream>,
    pub container: ContainerType,
    /// Opaque resource cost used by external admission control
    pub cost: u32,
}


impl fmt::Debug for ResolvedStream {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "ResolvedStream" )
            .field( "container", &self.container )
            .field( "cost", &self.cost )
            .field( "destroyed", &self.stream.is_destroyed() )
            .finish()
    }
}


/// Produces playable streams from source descriptors.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(
        &self,
        source: &dyn AudioSource,
        options: &ResolveOptions,
    ) -> Result<ResolvedStream, PlaybackError>;
}


/// Releases a stream on the next scheduler tick.
///
/// Deferring keeps teardown from racing a read that is already in flight.
pub(crate) fn release_deferred( stream: Arc<dyn AudioStream> ) {
    tokio::spawn( async move {
        tokio::task::yield_now().await;
        if !stream.is_destroyed() {
            stream.destroy();
            tracing::debug!( "Released audio stream" );
        }
    });
}


/// An `AudioStream` whose end and teardown are driven by its producer.
///
/// Resolvers wrap whatever actually moves the bytes and call [`end`] when
/// the producer hits EOF.
///
/// [`end`]: SignalStream::end
#[derive( Debug )]
pub struct SignalStream {
    ended: watch::Sender<bool>,
    destroyed: AtomicBool,
}


impl SignalStream {
    pub fn new() -> Self {
        let ( ended, _ ) = watch::channel( false );
        Self {
            ended,
            destroyed: AtomicBool::new( false ),
        }
    }


    /// Marks the stream as fully consumed. Ignored after `destroy`.
    pub fn end( &self ) {
        if !self.is_destroyed() {
            self.ended.send_replace( true );
        }
    }


    pub fn is_ended( &self ) -> bool {
        *self.ended.borrow()
    }
}


impl Default for SignalStream {
    fn default() -> Self {
        Self::new()
    }
}


impl AudioStream for SignalStream {
    fn finished( &self ) -> BoxFuture<'static, ()> {
        let mut rx = self.ended.subscribe();
        async move {
            if rx.wait_for( |ended| *ended ).await.is_err() {
                future::pending::<()>().await;
            }
        }.boxed()
    }


    fn destroy( &self ) {
        self.destroyed.store( true, Ordering::Release );
    }


    fn is_destroyed( &self ) -> bool {
        self.destroyed.load( Ordering::Acquire )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;


    #[test]
    fn test_container_parse() {
        assert_eq!( "webm/opus".parse::<ContainerType>().unwrap(), ContainerType::WebmOpus );
        assert_eq!( " OGG/OPUS ".parse::<ContainerType>().unwrap(), ContainerType::OggOpus );
        assert_eq!( "mp3".parse::<ContainerType>().unwrap(), ContainerType::Arbitrary );
        assert!( !ContainerType::Arbitrary.is_passthrough() );
        assert!( ContainerType::Raw.is_passthrough() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_signal_stream_finishes_on_end() {
        let stream = Arc::new( SignalStream::new() );
        let finished = stream.finished();
        stream.end();
        tokio::time::timeout( Duration::from_secs( 1 ), finished ).await.unwrap();
    }


    #[tokio::test( start_paused = true )]
    async fn test_destroyed_stream_never_finishes() {
        let stream = Arc::new( SignalStream::new() );
        stream.destroy();
        stream.end();
        assert!( !stream.is_ended() );
        let result = tokio::time::timeout( Duration::from_secs( 1 ), stream.finished() ).await;
        assert!( result.is_err() );
    }


    #[tokio::test]
    async fn test_release_is_deferred_and_idempotent() {
        let stream = Arc::new( SignalStream::new() );
        release_deferred( stream.clone() );
        release_deferred( stream.clone() );
        assert!( !stream.is_destroyed() );
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!( stream.is_destroyed() );
    }
}
