//! Playback engine
//!
//! `PlaybackEngine` wraps a single low-level `AudioPlayer` (the thing that
//! actually pushes encoded frames into a voice connection) and gives the
//! controller a uniform view of it: a status that can be awaited with a
//! bound, and a stream of state-change and error events.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{ AtomicU32, AtomicU64, Ordering };
use std::time::Duration;

use tokio::sync::{ broadcast, watch };
use tokio_util::sync::CancellationToken;

use crate::error::PlaybackError;
use crate::resolver::{ AudioStream, ContainerType };


/// Status of the low-level player.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum PlayerStatus {
    Idle,
    Buffering,
    Playing,
    Paused,
}


/// Snapshot of the player's status and how long the current resource has played.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct PlayerState {
    pub status: PlayerStatus,
    pub playback_duration: Duration,
}


impl PlayerState {
    fn idle() -> Self {
        Self {
            status: PlayerStatus::Idle,
            playback_duration: Duration::ZERO,
        }
    }
}


/// Inline volume transform shared between the controller and the player.
///
/// Stored as f32 bits so either side can touch it without locking.
#[derive( Debug, Clone )]
pub struct VolumeHandle( Arc<AtomicU32> );


impl VolumeHandle {
    pub fn new( volume: f32 ) -> Self {
        Self( Arc::new( AtomicU32::new( volume.to_bits() ) ) )
    }


    /// Sets the gain (0.0 = mute, 1.0 = unity, >1.0 = boost).
    pub fn set( &self, volume: f32 ) {
        self.0.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn get( &self ) -> f32 {
        f32::from_bits( self.0.load( Ordering::Relaxed ) )
    }
}


/// Everything the player needs to play one session.
#[derive( Clone )]
pub struct AudioResource {
    pub stream: Arc<dyn AudioStream>,
    pub container: ContainerType,
    /// Present when inline volume is enabled
    pub volume: Option<VolumeHandle>,
    /// Expected remaining length after the seek offset
    pub length: Duration,
}


impl fmt::Debug for AudioResource {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "AudioResource" )
            .field( "container", &self.container )
            .field( "volume", &self.volume.as_ref().map( VolumeHandle::get ) )
            .field( "length", &self.length )
            .finish()
    }
}


/// Events raised by the engine.
#[derive( Debug, Clone )]
pub enum EngineEvent {
    StateChanged { old: PlayerState, new: PlayerState },
    Error( PlaybackError ),
}


/// Low-level audio player bound to a voice connection.
///
/// Implementations report progress through the `StatusReporter` they are
/// handed with each resource: `Playing` once audio flows, playback time as
/// it accumulates, `Idle` when the resource is exhausted or stopped, and
/// any fault they hit along the way.
pub trait AudioPlayer: Send + Sync {
    fn play( &self, resource: AudioResource, reporter: StatusReporter ) -> Result<(), PlaybackError>;

    fn pause( &self ) -> bool;

    fn unpause( &self ) -> bool;

    /// Stops the current resource. `force` skips any graceful drain.
    fn stop( &self, force: bool ) -> bool;
}


struct EngineShared {
    state: watch::Sender<PlayerState>,
    events: broadcast::Sender<EngineEvent>,
    /// Bumped for every resource so stale reporters are ignored
    generation: AtomicU64,
}


impl EngineShared {
    fn transition( &self, status: PlayerStatus ) {
        let mut change = None;
        self.state.send_if_modified( |state| {
            if state.status == status {
                return false;
            }
            let old = *state;
            state.status = status;
            if matches!( status, PlayerStatus::Idle | PlayerStatus::Buffering ) {
                state.playback_duration = Duration::ZERO;
            }
            change = Some(( old, *state ));
            true
        });

        if let Some(( old, new )) = change {
            tracing::trace!( "Player {:?} -> {:?}", old.status, new.status );
            let _ = self.events.send( EngineEvent::StateChanged { old, new } );
        }
    }
}


/// Reporting handle for one resource.
#[derive( Clone )]
pub struct StatusReporter {
    shared: Arc<EngineShared>,
    generation: u64,
}


impl StatusReporter {
    /// Whether this reporter still belongs to the resource being played.
    pub fn is_current( &self ) -> bool {
        self.shared.generation.load( Ordering::Acquire ) == self.generation
    }


    pub fn set_status( &self, status: PlayerStatus ) {
        if self.is_current() {
            self.shared.transition( status );
        }
    }


    pub fn set_playback_duration( &self, duration: Duration ) {
        if self.is_current() {
            self.shared.state.send_modify( |state| state.playback_duration = duration );
        }
    }


    pub fn error( &self, error: PlaybackError ) {
        if self.is_current() {
            let _ = self.shared.events.send( EngineEvent::Error( error ) );
        }
    }
}


/// Controller-facing wrapper around one `AudioPlayer`.
pub struct PlaybackEngine {
    player: Arc<dyn AudioPlayer>,
    shared: Arc<EngineShared>,
    /// Cancelled when the engine is dropped
    shutdown: CancellationToken,
}


impl PlaybackEngine {
    pub fn new( player: Arc<dyn AudioPlayer> ) -> Self {
        let ( state, _ ) = watch::channel( PlayerState::idle() );
        let ( events, _ ) = broadcast::channel( 32 );
        Self {
            player,
            shared: Arc::new( EngineShared {
                state,
                events,
                generation: AtomicU64::new( 0 ),
            }),
            shutdown: CancellationToken::new(),
        }
    }


    /// Hands a resource to the player. The engine enters `Buffering` until
    /// the player reports otherwise.
    pub fn play( &self, resource: AudioResource ) -> Result<(), PlaybackError> {
        let generation = self.shared.generation.fetch_add( 1, Ordering::AcqRel ) + 1;
        self.shared.transition( PlayerStatus::Buffering );

        let reporter = StatusReporter {
            shared: Arc::clone( &self.shared ),
            generation,
        };
        if let Err( e ) = self.player.play( resource, reporter ) {
            self.shared.transition( PlayerStatus::Idle );
            return Err( e );
        }
        Ok(())
    }


    pub fn pause( &self ) -> bool {
        if self.status() != PlayerStatus::Playing || !self.player.pause() {
            return false;
        }
        self.shared.transition( PlayerStatus::Paused );
        true
    }


    pub fn unpause( &self ) -> bool {
        if self.status() != PlayerStatus::Paused || !self.player.unpause() {
            return false;
        }
        self.shared.transition( PlayerStatus::Playing );
        true
    }


    /// Stops the current resource.
    ///
    /// A forced stop is synchronous: the engine is `Idle` when this returns.
    /// A graceful stop leaves the transition to the player.
    pub fn stop( &self, force: bool ) -> bool {
        if self.status() == PlayerStatus::Idle {
            return false;
        }

        let stopped = self.player.stop( force );
        if force {
            // Orphan the old reporter so a late report cannot revive the session
            self.shared.generation.fetch_add( 1, Ordering::AcqRel );
            self.shared.transition( PlayerStatus::Idle );
        }
        stopped
    }


    pub fn state( &self ) -> PlayerState {
        *self.shared.state.borrow()
    }


    pub fn status( &self ) -> PlayerStatus {
        self.state().status
    }


    pub fn playback_duration( &self ) -> Duration {
        self.state().playback_duration
    }


    /// Waits until the player reaches `status`, or fails after `timeout`.
    pub async fn wait_for( &self, status: PlayerStatus, timeout: Duration ) -> Result<(), PlaybackError> {
        let mut rx = self.shared.state.subscribe();
        let reached = matches!(
            tokio::time::timeout( timeout, rx.wait_for( |state| state.status == status ) ).await,
            Ok( Ok( _ ) )
        );
        if reached {
            Ok(())
        } else {
            Err( PlaybackError::StateTimeout { expected: status, timeout } )
        }
    }


    pub fn subscribe( &self ) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }


    /// Token cancelled once this engine is dropped.
    ///
    /// Reporters held by the player keep the event channel open, so
    /// subscribers watch this instead of waiting for the channel to close.
    pub fn shutdown_token( &self ) -> CancellationToken {
        self.shutdown.clone()
    }
}


impl Drop for PlaybackEngine {
    fn drop( &mut self ) {
        self.shutdown.cancel();
    }
}


impl fmt::Debug for PlaybackEngine {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "PlaybackEngine" )
            .field( "state", &self.state() )
            .finish()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::{ resource, MockPlayer };


    fn engine() -> ( PlaybackEngine, Arc<MockPlayer> ) {
        let player = Arc::new( MockPlayer::new() );
        ( PlaybackEngine::new( player.clone() ), player )
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_buffers_until_player_reports() {
        let ( engine, player ) = engine();
        player.set_auto_start( false );
        engine.play( resource() ).unwrap();
        assert_eq!( engine.status(), PlayerStatus::Buffering );

        player.reporter().unwrap().set_status( PlayerStatus::Playing );
        engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 10 ) ).await.unwrap();
    }


    #[tokio::test( start_paused = true )]
    async fn test_wait_for_times_out() {
        let ( engine, player ) = engine();
        player.set_auto_start( false );
        engine.play( resource() ).unwrap();

        let err = engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 10 ) ).await.unwrap_err();
        assert!( matches!( err, PlaybackError::StateTimeout { expected: PlayerStatus::Playing, .. } ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_wait_for_sees_later_transition() {
        let ( engine, player ) = engine();
        player.set_auto_start( false );
        engine.play( resource() ).unwrap();

        let reporter = player.reporter().unwrap();
        tokio::spawn( async move {
            tokio::time::sleep( Duration::from_secs( 3 ) ).await;
            reporter.set_status( PlayerStatus::Playing );
        });
        engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 10 ) ).await.unwrap();
        assert_eq!( engine.status(), PlayerStatus::Playing );
    }


    #[tokio::test]
    async fn test_failed_play_returns_to_idle() {
        let ( engine, player ) = engine();
        player.fail_next_play( PlaybackError::Player( "no encoder".into() ) );
        assert!( engine.play( resource() ).is_err() );
        assert_eq!( engine.status(), PlayerStatus::Idle );
    }


    #[tokio::test]
    async fn test_force_stop_is_immediate_and_orphans_reporter() {
        let ( engine, player ) = engine();
        player.set_graceful_stop( false );
        engine.play( resource() ).unwrap();
        let reporter = player.reporter().unwrap();
        assert_eq!( engine.status(), PlayerStatus::Playing );

        assert!( engine.stop( true ) );
        assert_eq!( engine.status(), PlayerStatus::Idle );

        reporter.set_status( PlayerStatus::Playing );
        assert_eq!( engine.status(), PlayerStatus::Idle );
        assert!( !reporter.is_current() );
    }


    #[tokio::test]
    async fn test_pause_and_unpause() {
        let ( engine, _player ) = engine();
        assert!( !engine.pause() );

        engine.play( resource() ).unwrap();
        assert!( engine.pause() );
        assert_eq!( engine.status(), PlayerStatus::Paused );
        assert!( !engine.pause() );
        assert!( engine.unpause() );
        assert_eq!( engine.status(), PlayerStatus::Playing );
    }


    #[tokio::test]
    async fn test_state_changes_are_broadcast() {
        let ( engine, player ) = engine();
        let mut events = engine.subscribe();
        engine.play( resource() ).unwrap();
        player.reporter().unwrap().set_playback_duration( Duration::from_secs( 42 ) );
        engine.stop( true );

        let mut seen = Vec::new();
        while let Ok( EngineEvent::StateChanged { old, new } ) = events.try_recv() {
            seen.push(( old.status, new.status, old.playback_duration ));
        }
        assert_eq!( seen, vec![
            ( PlayerStatus::Idle, PlayerStatus::Buffering, Duration::ZERO ),
            ( PlayerStatus::Buffering, PlayerStatus::Playing, Duration::ZERO ),
            ( PlayerStatus::Playing, PlayerStatus::Idle, Duration::from_secs( 42 ) ),
        ]);
    }


    #[tokio::test]
    async fn test_drop_cancels_shutdown_token() {
        let ( engine, _player ) = engine();
        let token = engine.shutdown_token();
        assert!( !token.is_cancelled() );
        drop( engine );
        assert!( token.is_cancelled() );
    }


    #[test]
    fn test_volume_handle_shared() {
        let volume = VolumeHandle::new( 1.0 );
        let other = volume.clone();
        other.set( 0.25 );
        assert_eq!( volume.get(), 0.25 );
    }
}
