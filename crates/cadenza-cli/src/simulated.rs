//! Simulated voice transport
//!
//! Stands in for a real voice connection: the player paces playback on the
//! wall clock (optionally sped up), and a shared `Transport` carries the
//! pause state to the stream producers so paused audio stops draining.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use cadenza_core::{ AudioPlayer, AudioResource, PlaybackError, PlayerStatus, StatusReporter, VoiceConnection };


/// How often the player reports playback progress.
const TICK: Duration = Duration::from_millis( 250 );


/// Pause state and clock rate shared by the player and the stream producers.
#[derive( Debug )]
pub struct Transport {
    paused: watch::Sender<bool>,
    speed: f64,
}


impl Transport {
    /// `speed` multiplies the playback rate; non-positive values mean 1.0.
    pub fn new( speed: f64 ) -> Self {
        let ( paused, _ ) = watch::channel( false );
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        Self { paused, speed }
    }


    pub fn speed( &self ) -> f64 {
        self.speed
    }


    /// Wall-clock time needed to play `media` worth of audio.
    pub fn scale( &self, media: Duration ) -> Duration {
        media.div_f64( self.speed )
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.send_replace( paused );
    }


    pub fn is_paused( &self ) -> bool {
        *self.paused.borrow()
    }


    pub fn subscribe( &self ) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}


struct Playback {
    task: JoinHandle<()>,
    reporter: StatusReporter,
}


/// Player that "plays" by watching the clock until its stream runs dry.
pub struct PacedPlayer {
    transport: Arc<Transport>,
    current: Mutex<Option<Playback>>,
}


impl PacedPlayer {
    pub fn new( transport: Arc<Transport> ) -> Self {
        Self {
            transport,
            current: Mutex::new( None ),
        }
    }
}


impl AudioPlayer for PacedPlayer {
    fn play( &self, resource: AudioResource, reporter: StatusReporter ) -> Result<(), PlaybackError> {
        if let Some( previous ) = self.current.lock().take() {
            previous.task.abort();
        }
        self.transport.set_paused( false );

        let task = tokio::spawn( run( resource, reporter.clone(), self.transport.clone() ) );
        *self.current.lock() = Some( Playback { task, reporter } );
        Ok(())
    }


    fn pause( &self ) -> bool {
        self.transport.set_paused( true );
        true
    }


    fn unpause( &self ) -> bool {
        self.transport.set_paused( false );
        true
    }


    fn stop( &self, force: bool ) -> bool {
        let Some( playback ) = self.current.lock().take() else {
            return false;
        };
        playback.task.abort();
        self.transport.set_paused( false );
        if !force {
            playback.reporter.set_status( PlayerStatus::Idle );
        }
        true
    }
}


async fn run( resource: AudioResource, reporter: StatusReporter, transport: Arc<Transport> ) {
    tracing::debug!(
        "Playing {} resource, {:?} long, volume {:?}",
        resource.container,
        resource.length,
        resource.volume.as_ref().map( |v| v.get() )
    );
    reporter.set_status( PlayerStatus::Playing );

    let mut finished = resource.stream.finished();
    let mut ticker = tokio::time::interval( TICK );
    let mut elapsed = Duration::ZERO;
    loop {
        tokio::select! {
            _ = &mut finished => break,
            _ = ticker.tick() => {
                if !transport.is_paused() {
                    elapsed += TICK.mul_f64( transport.speed() );
                    reporter.set_playback_duration( elapsed );
                }
            }
        }
    }
    reporter.set_status( PlayerStatus::Idle );
}


/// A pretend voice channel that is ready as soon as it exists.
pub struct SimulatedConnection {
    channel: String,
    bitrate: u32,
    ready: AtomicBool,
    transport: Arc<Transport>,
}


impl SimulatedConnection {
    pub fn new( channel: impl Into<String>, bitrate: u32, transport: Arc<Transport> ) -> Self {
        Self {
            channel: channel.into(),
            bitrate,
            ready: AtomicBool::new( true ),
            transport,
        }
    }
}


impl VoiceConnection for SimulatedConnection {
    fn is_ready( &self ) -> bool {
        self.ready.load( Ordering::Acquire )
    }

    fn channel_id( &self ) -> String {
        self.channel.clone()
    }

    fn bitrate( &self ) -> u32 {
        self.bitrate
    }

    fn create_player( &self ) -> Arc<dyn AudioPlayer> {
        Arc::new( PacedPlayer::new( self.transport.clone() ) )
    }

    fn disconnect( &self ) {
        self.ready.store( false, Ordering::Release );
        tracing::info!( "Left {}", self.channel );
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use cadenza_core::{ AudioStream, ContainerType, PlaybackEngine, SignalStream };


    fn resource( stream: Arc<SignalStream> ) -> AudioResource {
        AudioResource {
            stream,
            container: ContainerType::Arbitrary,
            volume: None,
            length: Duration::from_secs( 60 ),
        }
    }


    #[test]
    fn test_transport_scales_by_speed() {
        let transport = Transport::new( 4.0 );
        assert_eq!( transport.scale( Duration::from_secs( 8 ) ), Duration::from_secs( 2 ) );
        assert_eq!( Transport::new( 0.0 ).speed(), 1.0 );
        assert_eq!( Transport::new( f64::NAN ).speed(), 1.0 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_player_reports_progress_until_stream_ends() {
        let transport = Arc::new( Transport::new( 2.0 ) );
        let engine = PlaybackEngine::new( Arc::new( PacedPlayer::new( transport ) ) );
        let stream = Arc::new( SignalStream::new() );

        engine.play( resource( stream.clone() ) ).unwrap();
        engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 1 ) ).await.unwrap();

        tokio::time::sleep( Duration::from_millis( 1100 ) ).await;
        assert!( engine.playback_duration() >= Duration::from_secs( 2 ) );

        stream.end();
        engine.wait_for( PlayerStatus::Idle, Duration::from_secs( 1 ) ).await.unwrap();
        assert!( !stream.is_destroyed() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_paused_player_holds_position() {
        let transport = Arc::new( Transport::new( 1.0 ) );
        let engine = PlaybackEngine::new( Arc::new( PacedPlayer::new( transport.clone() ) ) );
        engine.play( resource( Arc::new( SignalStream::new() ) ) ).unwrap();
        engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 1 ) ).await.unwrap();

        assert!( engine.pause() );
        assert!( transport.is_paused() );
        let held = engine.playback_duration();
        tokio::time::sleep( Duration::from_secs( 5 ) ).await;
        assert_eq!( engine.playback_duration(), held );

        assert!( engine.unpause() );
        assert!( !transport.is_paused() );
    }


    #[tokio::test]
    async fn test_graceful_stop_goes_idle() {
        let transport = Arc::new( Transport::new( 1.0 ) );
        let engine = PlaybackEngine::new( Arc::new( PacedPlayer::new( transport ) ) );
        engine.play( resource( Arc::new( SignalStream::new() ) ) ).unwrap();
        engine.wait_for( PlayerStatus::Playing, Duration::from_secs( 1 ) ).await.unwrap();

        assert!( engine.stop( false ) );
        assert_eq!( engine.status(), PlayerStatus::Idle );
    }


    #[test]
    fn test_connection_hands_out_players() {
        let connection = SimulatedConnection::new( "voice", 64_000, Arc::new( Transport::new( 1.0 ) ) );
        assert!( connection.is_ready() );
        assert_eq!( connection.bitrate(), 64_000 );
        connection.disconnect();
        assert!( !connection.is_ready() );
    }
}
