//! Scripted test doubles for every port the controller talks to.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU32, AtomicUsize, Ordering };
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::engine::{ AudioPlayer, AudioResource, PlayerStatus, StatusReporter };
use crate::error::{ NotifyError, PlaybackError };
use crate::events::PlaybackEvent;
use crate::notify::{ Notification, NotificationPort };
use crate::resolver::{ ContainerType, ResolveOptions, ResolvedStream, SignalStream, StreamResolver };
use crate::source::AudioSource;
use crate::voice::VoiceConnection;


#[derive( Debug )]
pub struct MockSource {
    url: String,
    length: u64,
    live: bool,
    private: bool,
    waiting: AtomicBool,
    purges: AtomicUsize,
}


impl MockSource {
    /// Source whose title is its url.
    pub fn new( url: &str, length: u64 ) -> Self {
        Self {
            url: url.to_string(),
            length,
            live: false,
            private: false,
            waiting: AtomicBool::new( false ),
            purges: AtomicUsize::new( 0 ),
        }
    }


    pub fn arc( url: &str, length: u64 ) -> Arc<dyn AudioSource> {
        Arc::new( Self::new( url, length ) )
    }


    /// Live stream that has not started yet.
    pub fn scheduled( mut self ) -> Self {
        self.live = true;
        self.waiting.store( true, Ordering::SeqCst );
        self
    }


    pub fn private( mut self ) -> Self {
        self.private = true;
        self
    }


    pub fn go_live( &self ) {
        self.waiting.store( false, Ordering::SeqCst );
    }


    pub fn purge_count( &self ) -> usize {
        self.purges.load( Ordering::SeqCst )
    }
}


#[async_trait]
impl AudioSource for MockSource {
    fn url( &self ) -> &str {
        &self.url
    }

    fn title( &self ) -> &str {
        &self.url
    }

    fn length_seconds( &self ) -> u64 {
        self.length
    }

    fn is_live_stream( &self ) -> bool {
        self.live
    }

    fn is_private( &self ) -> bool {
        self.private
    }

    fn awaiting_live( &self ) -> bool {
        self.waiting.load( Ordering::SeqCst )
    }

    fn purge_cache( &self ) {
        self.purges.fetch_add( 1, Ordering::SeqCst );
    }
}


struct PlayerScript {
    reporter: Option<StatusReporter>,
    auto_start: bool,
    graceful_stop: bool,
    fail_next: Option<PlaybackError>,
    last_resource: Option<AudioResource>,
}


/// Player that reports `Playing` as soon as it is handed a resource unless
/// told otherwise.
pub struct MockPlayer {
    script: Mutex<PlayerScript>,
    plays: AtomicUsize,
    stops: AtomicUsize,
}


impl MockPlayer {
    pub fn new() -> Self {
        Self {
            script: Mutex::new( PlayerScript {
                reporter: None,
                auto_start: true,
                graceful_stop: true,
                fail_next: None,
                last_resource: None,
            }),
            plays: AtomicUsize::new( 0 ),
            stops: AtomicUsize::new( 0 ),
        }
    }


    pub fn set_auto_start( &self, auto_start: bool ) {
        self.script.lock().auto_start = auto_start;
    }


    /// Whether a non-forced stop reports `Idle` right away.
    pub fn set_graceful_stop( &self, graceful: bool ) {
        self.script.lock().graceful_stop = graceful;
    }


    pub fn fail_next_play( &self, error: PlaybackError ) {
        self.script.lock().fail_next = Some( error );
    }


    pub fn reporter( &self ) -> Option<StatusReporter> {
        self.script.lock().reporter.clone()
    }


    pub fn last_resource( &self ) -> Option<AudioResource> {
        self.script.lock().last_resource.clone()
    }


    /// Reports the current resource as drained.
    pub fn report_idle( &self ) {
        if let Some( reporter ) = self.reporter() {
            reporter.set_status( PlayerStatus::Idle );
        }
    }


    pub fn play_count( &self ) -> usize {
        self.plays.load( Ordering::SeqCst )
    }


    pub fn stop_count( &self ) -> usize {
        self.stops.load( Ordering::SeqCst )
    }
}


impl AudioPlayer for MockPlayer {
    fn play( &self, resource: AudioResource, reporter: StatusReporter ) -> Result<(), PlaybackError> {
        let mut script = self.script.lock();
        if let Some( error ) = script.fail_next.take() {
            return Err( error );
        }
        self.plays.fetch_add( 1, Ordering::SeqCst );
        script.last_resource = Some( resource );
        script.reporter = Some( reporter.clone() );
        if script.auto_start {
            reporter.set_status( PlayerStatus::Playing );
        }
        Ok(())
    }


    fn pause( &self ) -> bool {
        true
    }


    fn unpause( &self ) -> bool {
        true
    }


    fn stop( &self, force: bool ) -> bool {
        self.stops.fetch_add( 1, Ordering::SeqCst );
        let script = self.script.lock();
        if !force && script.graceful_stop {
            if let Some( reporter ) = &script.reporter {
                reporter.set_status( PlayerStatus::Idle );
            }
        }
        true
    }
}


/// A resource around a fresh `SignalStream`.
pub fn resource() -> AudioResource {
    AudioResource {
        stream: Arc::new( SignalStream::new() ),
        container: ContainerType::OggOpus,
        volume: None,
        length: Duration::from_secs( 180 ),
    }
}


/// Resolver that hands out `SignalStream`s, failing on request.
#[derive( Default )]
pub struct MockResolver {
    script: Mutex<VecDeque<PlaybackError>>,
    calls: Mutex<Vec<( String, ResolveOptions )>>,
    streams: Mutex<Vec<Arc<SignalStream>>>,
    delay: Mutex<Option<Duration>>,
}


impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }


    /// Queues `count` failures ahead of any successes.
    pub fn fail_times( &self, count: usize, error: PlaybackError ) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back( error.clone() );
        }
    }


    pub fn set_delay( &self, delay: Duration ) {
        *self.delay.lock() = Some( delay );
    }


    pub fn calls( &self ) -> Vec<( String, ResolveOptions )> {
        self.calls.lock().clone()
    }


    pub fn call_count( &self ) -> usize {
        self.calls.lock().len()
    }


    pub fn streams( &self ) -> Vec<Arc<SignalStream>> {
        self.streams.lock().clone()
    }


    pub fn last_stream( &self ) -> Option<Arc<SignalStream>> {
        self.streams.lock().last().cloned()
    }
}


#[async_trait]
impl StreamResolver for MockResolver {
    async fn resolve(
        &self,
        source: &dyn AudioSource,
        options: &ResolveOptions,
    ) -> Result<ResolvedStream, PlaybackError> {
        self.calls.lock().push(( source.url().to_string(), options.clone() ));

        let delay = *self.delay.lock();
        if let Some( delay ) = delay {
            tokio::time::sleep( delay ).await;
        }

        let failure = self.script.lock().pop_front();
        if let Some( error ) = failure {
            return Err( error );
        }

        let stream = Arc::new( SignalStream::new() );
        self.streams.lock().push( stream.clone() );
        Ok( ResolvedStream {
            stream,
            container: ContainerType::OggOpus,
            cost: 1,
        })
    }
}


pub struct MockConnection {
    ready: AtomicBool,
    bitrate: AtomicU32,
    player: Arc<MockPlayer>,
    disconnects: AtomicUsize,
}


impl MockConnection {
    pub fn new( player: Arc<MockPlayer> ) -> Self {
        Self {
            ready: AtomicBool::new( true ),
            bitrate: AtomicU32::new( 96_000 ),
            player,
            disconnects: AtomicUsize::new( 0 ),
        }
    }


    pub fn set_ready( &self, ready: bool ) {
        self.ready.store( ready, Ordering::SeqCst );
    }


    pub fn disconnect_count( &self ) -> usize {
        self.disconnects.load( Ordering::SeqCst )
    }
}


impl VoiceConnection for MockConnection {
    fn is_ready( &self ) -> bool {
        self.ready.load( Ordering::SeqCst )
    }

    fn channel_id( &self ) -> String {
        "test-channel".to_string()
    }

    fn bitrate( &self ) -> u32 {
        self.bitrate.load( Ordering::SeqCst )
    }

    fn create_player( &self ) -> Arc<dyn AudioPlayer> {
        self.player.clone()
    }

    fn disconnect( &self ) {
        self.ready.store( false, Ordering::SeqCst );
        self.disconnects.fetch_add( 1, Ordering::SeqCst );
    }
}


#[derive( Default )]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}


impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }


    /// Makes every delivery fail after being recorded.
    pub fn set_failing( &self, failing: bool ) {
        self.failing.store( failing, Ordering::SeqCst );
    }


    pub fn sent( &self ) -> Vec<Notification> {
        self.sent.lock().clone()
    }


    pub fn count( &self, pred: impl Fn( &Notification ) -> bool ) -> usize {
        self.sent.lock().iter().filter( |n| pred( n ) ).count()
    }
}


#[async_trait]
impl NotificationPort for RecordingNotifier {
    async fn notify( &self, notification: Notification ) -> Result<(), NotifyError> {
        self.sent.lock().push( notification );
        if self.failing.load( Ordering::SeqCst ) {
            return Err( NotifyError::Delivery( "channel gone".into() ) );
        }
        Ok(())
    }
}


/// Receives events until one matches, or panics after `within` of (virtual) time.
pub async fn expect_event(
    rx: &mut broadcast::Receiver<PlaybackEvent>,
    within: Duration,
    pred: impl Fn( &PlaybackEvent ) -> bool,
) -> PlaybackEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok( event ) if pred( &event ) => return event,
                Ok( _ ) | Err( broadcast::error::RecvError::Lagged( _ ) ) => continue,
                Err( broadcast::error::RecvError::Closed ) => panic!( "event bus closed" ),
            }
        }
    };
    match tokio::time::timeout( within, wait ).await {
        Ok( event ) => event,
        Err( _ ) => panic!( "expected event not seen within {:?}", within ),
    }
}


/// Drains every event already buffered on `rx`.
pub fn drain( rx: &mut broadcast::Receiver<PlaybackEvent> ) -> Vec<PlaybackEvent> {
    let mut events = Vec::new();
    while let Ok( event ) = rx.try_recv() {
        events.push( event );
    }
    events
}


/// Runs every ready task until the runtime goes quiet.
///
/// Only meaningful with a paused clock, which does not advance while any
/// task can still make progress.
pub async fn settle() {
    tokio::time::sleep( Duration::from_millis( 1 ) ).await;
}
