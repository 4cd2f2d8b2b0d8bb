//! Lifecycle events and the typed event bus.
//!
//! Observers subscribe to the bus and receive every event emitted after
//! subscribing. Dropping the receiver unsubscribes.

use std::time::Duration;

use tokio::sync::broadcast;


/// Events emitted by the playback controller.
#[derive( Debug, Clone, PartialEq )]
pub enum PlaybackEvent {
    /// `play` was invoked, whether or not it went anywhere
    PlayCalled { seek: u64 },

    /// Preconditions passed and a session is being prepared
    PlayPreparing { seek: u64 },

    PlayStarted,

    PlayCompleted,

    PlayFailed,

    /// The player left `Playing` for `Idle`
    ReportPlaybackDuration { duration: Duration, error_count: u32 },

    Stop,

    Disconnect,

    DisconnectAttempt,

    Pause,

    Resume,

    Rewind,

    VolumeChanged { volume: u8 },

    /// An error was absorbed by the controller
    HandledError { message: String },
}


impl PlaybackEvent {
    /// Short name used in logs.
    pub fn name( &self ) -> &'static str {
        match self {
            Self::PlayCalled { .. } => "playCalled",
            Self::PlayPreparing { .. } => "playPreparing",
            Self::PlayStarted => "playStarted",
            Self::PlayCompleted => "playCompleted",
            Self::PlayFailed => "playFailed",
            Self::ReportPlaybackDuration { .. } => "reportPlaybackDuration",
            Self::Stop => "stop",
            Self::Disconnect => "disconnect",
            Self::DisconnectAttempt => "disconnectAttempt",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Rewind => "rewind",
            Self::VolumeChanged { .. } => "volumeChanged",
            Self::HandledError { .. } => "handledError",
        }
    }
}


/// One-to-many broadcast of `PlaybackEvent`s.
#[derive( Debug, Clone )]
pub struct EventBus {
    tx: broadcast::Sender<PlaybackEvent>,
    capacity: usize,
}


impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per slow subscriber.
    pub fn new( capacity: usize ) -> Self {
        let ( tx, _ ) = broadcast::channel( capacity.max( 1 ) );
        Self { tx, capacity }
    }


    pub fn subscribe( &self ) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }


    /// Emits an event. Having no subscribers is not an error.
    pub fn emit( &self, event: PlaybackEvent ) {
        tracing::trace!( "Event: {}", event.name() );
        let _ = self.tx.send( event );
    }


    pub fn subscriber_count( &self ) -> usize {
        self.tx.receiver_count()
    }


    pub fn capacity( &self ) -> usize {
        self.capacity
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new( 8 );
        bus.emit( PlaybackEvent::Stop );
        assert_eq!( bus.subscriber_count(), 0 );
    }


    #[tokio::test]
    async fn test_subscribers_see_events_after_subscribing() {
        let bus = EventBus::new( 8 );
        bus.emit( PlaybackEvent::Pause );

        let mut rx = bus.subscribe();
        bus.emit( PlaybackEvent::PlayCalled { seek: 30 } );
        bus.emit( PlaybackEvent::Resume );

        assert_eq!( rx.recv().await.unwrap(), PlaybackEvent::PlayCalled { seek: 30 } );
        assert_eq!( rx.recv().await.unwrap(), PlaybackEvent::Resume );
    }


    #[test]
    fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new( 8 );
        let rx = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!( bus.subscriber_count(), 2 );
        drop( rx );
        assert_eq!( bus.subscriber_count(), 1 );
    }


    #[test]
    fn test_event_names() {
        assert_eq!( PlaybackEvent::DisconnectAttempt.name(), "disconnectAttempt" );
        assert_eq!(
            PlaybackEvent::ReportPlaybackDuration { duration: Duration::ZERO, error_count: 0 }.name(),
            "reportPlaybackDuration"
        );
    }
}
