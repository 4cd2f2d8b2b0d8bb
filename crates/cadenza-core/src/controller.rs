//! Per-guild playback controller
//!
//! `PlaybackController` owns the lifecycle of one guild's audio: it takes
//! the head of the queue, waits for it to go live if it has to, resolves
//! it into a stream, hands it to the engine and decides what happens when
//! the stream ends or something breaks. Every failure is absorbed here.
//! The only signals leaving the controller are `PlaybackEvent`s on the bus
//! and `Notification`s sent to the bound text surface.
//!
//! Every session is tagged with an attempt number. Callbacks that outlive
//! their session (stream-end watchers, late engine errors, a resolve that
//! returns after `stop`) compare their attempt against the current one and
//! bow out when they no longer match.

use std::fmt;
use std::mem;
use std::sync::{ Arc, Weak };
use std::time::Duration;

use futures::future::{ BoxFuture, FutureExt };
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::PlaybackConfig;
use crate::engine::{ AudioResource, EngineEvent, PlaybackEngine, PlayerStatus, VolumeHandle };
use crate::error::PlaybackError;
use crate::events::{ EventBus, PlaybackEvent };
use crate::idle::IdleTimer;
use crate::live::{ LiveWaitCoordinator, LiveWaitOutcome };
use crate::notify::{ Notification, NotificationPort, NowPlaying };
use crate::queue::QueuePort;
use crate::resolver::{ release_deferred, AudioStream, ContainerType, ResolveOptions, StreamResolver };
use crate::source::{ AudioSource, QueueItem };
use crate::voice::VoiceConnection;


/// Observable lifecycle phase.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum PlaybackPhase {
    Idle,
    WaitingForLive,
    Preparing,
    Playing,
    /// The stream ended and the follow-up is being decided
    Completed,
    /// A failure is being handled
    Failed,
}


enum SessionState {
    Idle,
    WaitingForLive { attempt: u64, cancel: CancellationToken },
    Preparing { attempt: u64, cancel: CancellationToken },
    Playing { attempt: u64, cancel: CancellationToken },
    Completed { attempt: u64 },
    Failed { attempt: u64 },
}


impl SessionState {
    fn phase( &self ) -> PlaybackPhase {
        match self {
            Self::Idle => PlaybackPhase::Idle,
            Self::WaitingForLive { .. } => PlaybackPhase::WaitingForLive,
            Self::Preparing { .. } => PlaybackPhase::Preparing,
            Self::Playing { .. } => PlaybackPhase::Playing,
            Self::Completed { .. } => PlaybackPhase::Completed,
            Self::Failed { .. } => PlaybackPhase::Failed,
        }
    }


    /// True while `attempt` is the session being set up or played.
    fn is_active( &self, attempt: u64 ) -> bool {
        match self {
            Self::WaitingForLive { attempt: a, .. }
            | Self::Preparing { attempt: a, .. }
            | Self::Playing { attempt: a, .. } => *a == attempt,
            _ => false,
        }
    }


    fn active_attempt( &self ) -> Option<u64> {
        match self {
            Self::WaitingForLive { attempt, .. }
            | Self::Preparing { attempt, .. }
            | Self::Playing { attempt, .. } => Some( *attempt ),
            _ => None,
        }
    }


    /// Cancels whatever the session is still waiting on.
    fn cancel( &self ) {
        match self {
            Self::WaitingForLive { cancel, .. }
            | Self::Preparing { cancel, .. }
            | Self::Playing { cancel, .. } => cancel.cancel(),
            _ => {}
        }
    }
}


/// Consecutive-failure bookkeeping for the current source.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct RetryState {
    pub count: u32,
    pub last_url: Option<String>,
}


impl RetryState {
    /// Records a failure of `url`. Returns true when this is the first
    /// failure of a different source, which warrants purging its cache.
    ///
    /// Quiet failures never accumulate towards a skip.
    fn record_failure( &mut self, url: &str, quiet: bool ) -> bool {
        if !quiet && self.last_url.as_deref() == Some( url ) {
            self.count += 1;
            return false;
        }
        self.count = 1;
        self.last_url = Some( url.to_string() );
        true
    }


    /// Failures recorded so far against `url`.
    fn count_for( &self, url: &str ) -> u32 {
        if self.last_url.as_deref() == Some( url ) { self.count } else { 0 }
    }


    fn reset( &mut self ) {
        *self = Self::default();
    }
}


/// Resources owned by one resolved session.
struct PlaybackSession {
    stream: Arc<dyn AudioStream>,
    container: ContainerType,
    cost: u32,
    volume: Option<VolumeHandle>,
}


struct ControllerState {
    phase: SessionState,
    last_attempt: u64,
    current: Option<Arc<dyn AudioSource>>,
    /// Offset the current session started at, seconds
    seek: u64,
    session: Option<PlaybackSession>,
    retry: RetryState,
    connection: Option<Arc<dyn VoiceConnection>>,
    engine: Option<Arc<PlaybackEngine>>,
    idle_timer: Option<IdleTimer>,
    volume: u8,
    paused_by: Option<String>,
    effect_args: Vec<String>,
}


impl ControllerState {
    fn is_connected( &self ) -> bool {
        self.connection.as_ref().is_some_and( |c| c.is_ready() )
    }


    fn engine_status( &self ) -> PlayerStatus {
        self.engine.as_ref().map_or( PlayerStatus::Idle, |e| e.status() )
    }


    fn is_playing( &self ) -> bool {
        self.is_connected()
            && ( matches!( self.engine_status(), PlayerStatus::Playing | PlayerStatus::Paused )
                || matches!( self.phase, SessionState::WaitingForLive { .. } ) )
    }


    /// Takes the session out and schedules its stream for teardown.
    fn release_stream( &mut self ) {
        if let Some( session ) = self.session.take() {
            release_deferred( session.stream );
        }
    }
}


struct Inner {
    guild_id: String,
    config: PlaybackConfig,
    queue: Arc<dyn QueuePort>,
    resolver: Arc<dyn StreamResolver>,
    notifier: Option<Arc<dyn NotificationPort>>,
    live: LiveWaitCoordinator,
    events: EventBus,
    state: Mutex<ControllerState>,
}


/// Handle to one guild's playback controller. Clones share the controller.
#[derive( Clone )]
pub struct PlaybackController {
    inner: Arc<Inner>,
}


impl PlaybackController {
    pub fn new(
        guild_id: impl Into<String>,
        config: PlaybackConfig,
        queue: Arc<dyn QueuePort>,
        resolver: Arc<dyn StreamResolver>,
        notifier: Option<Arc<dyn NotificationPort>>,
    ) -> Self {
        let live = LiveWaitCoordinator::new( config.live_poll_interval() );
        let events = EventBus::new( config.event_capacity );
        Self {
            inner: Arc::new( Inner {
                guild_id: guild_id.into(),
                config,
                queue,
                resolver,
                notifier,
                live,
                events,
                state: Mutex::new( ControllerState {
                    phase: SessionState::Idle,
                    last_attempt: 0,
                    current: None,
                    seek: 0,
                    session: None,
                    retry: RetryState::default(),
                    connection: None,
                    engine: None,
                    idle_timer: None,
                    volume: 100,
                    paused_by: None,
                    effect_args: Vec::new(),
                }),
            }),
        }
    }


    fn from_weak( weak: &Weak<Inner> ) -> Option<Self> {
        weak.upgrade().map( |inner| Self { inner } )
    }


    pub fn guild_id( &self ) -> &str {
        &self.inner.guild_id
    }


    pub fn config( &self ) -> &PlaybackConfig {
        &self.inner.config
    }


    pub fn events( &self ) -> &EventBus {
        &self.inner.events
    }


    pub fn subscribe( &self ) -> broadcast::Receiver<PlaybackEvent> {
        self.inner.events.subscribe()
    }


    /// Binds the voice connection the host joined. A previous connection's
    /// player is discarded.
    pub fn attach_connection( &self, connection: Arc<dyn VoiceConnection> ) {
        let mut state = self.inner.state.lock();
        tracing::info!( guild = %self.inner.guild_id, "Attached to voice channel {}", connection.channel_id() );
        state.connection = Some( connection );
        state.engine = None;
    }


    pub fn is_connected( &self ) -> bool {
        self.inner.state.lock().is_connected()
    }


    /// True while audio is playing or paused, or a live wait is pending.
    pub fn is_playing( &self ) -> bool {
        self.inner.state.lock().is_playing()
    }


    pub fn is_paused( &self ) -> bool {
        self.inner.state.lock().engine_status() == PlayerStatus::Paused
    }


    pub fn is_waiting( &self ) -> bool {
        matches!( self.inner.state.lock().phase, SessionState::WaitingForLive { .. } )
    }


    pub fn is_preparing( &self ) -> bool {
        matches!( self.inner.state.lock().phase, SessionState::Preparing { .. } )
    }


    /// True while the idle disconnect timer is armed.
    pub fn finish_timeout( &self ) -> bool {
        self.inner.state.lock().idle_timer.as_ref().is_some_and( IdleTimer::is_armed )
    }


    pub fn state( &self ) -> PlaybackPhase {
        self.inner.state.lock().phase.phase()
    }


    pub fn current_source( &self ) -> Option<Arc<dyn AudioSource>> {
        self.inner.state.lock().current.clone()
    }


    /// Position within the current source, including the seek offset.
    pub fn current_time( &self ) -> Duration {
        let state = self.inner.state.lock();
        if !state.is_playing() {
            return Duration::ZERO;
        }
        match &state.engine {
            Some( engine ) if !matches!( engine.status(), PlayerStatus::Idle | PlayerStatus::Buffering ) => {
                Duration::from_secs( state.seek ) + engine.playback_duration()
            }
            _ => Duration::ZERO,
        }
    }


    /// Resource cost of the current session, zero when nothing is held.
    pub fn cost( &self ) -> u32 {
        self.inner.state.lock().session.as_ref().map_or( 0, |s| s.cost )
    }


    pub fn container( &self ) -> Option<ContainerType> {
        self.inner.state.lock().session.as_ref().map( |s| s.container )
    }


    pub fn volume( &self ) -> u8 {
        self.inner.state.lock().volume
    }


    pub fn retry_state( &self ) -> RetryState {
        self.inner.state.lock().retry.clone()
    }


    /// Sets the volume in percent. Applies immediately when the current
    /// session has an inline volume transform; returns whether it did.
    pub fn set_volume( &self, volume: u8 ) -> bool {
        self.inner.state.lock().volume = volume;
        let applied = self.apply_volume();
        self.inner.events.emit( PlaybackEvent::VolumeChanged { volume } );
        applied
    }


    /// Pushes the configured volume into the session's inline transform.
    fn apply_volume( &self ) -> bool {
        let state = self.inner.state.lock();
        match state.session.as_ref().and_then( |s| s.volume.as_ref() ) {
            Some( handle ) => {
                handle.set( f32::from( state.volume ) / 100.0 );
                true
            }
            None => false,
        }
    }


    /// Audio filter arguments for subsequent sessions.
    pub fn set_effect_args( &self, args: Vec<String> ) {
        self.inner.state.lock().effect_args = args;
    }


    /// Starts playing the head of the queue.
    ///
    /// Does nothing if the controller is not connected, already busy, or
    /// the queue is empty. `quiet` suppresses the preparing and now-playing
    /// notifications. Returns once the session is playing or has been
    /// handed to the error handler.
    pub async fn play( &self, seek: u64, quiet: bool ) {
        self.play_boxed( seek, quiet ).await
    }


    /// Boxed entry point so the recursive paths (retries, loops, queue
    /// advance) have a nameable future type.
    fn play_boxed( &self, seek: u64, quiet: bool ) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move { this.run_play( seek, quiet ).await }.boxed()
    }


    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    async fn run_play( &self, seek: u64, quiet: bool ) {
        self.inner.events.emit( PlaybackEvent::PlayCalled { seek } );

        let ( attempt, cancel, item ) = {
            let mut state = self.inner.state.lock();
            state.idle_timer = None;

            if !state.is_connected()
                || state.is_playing()
                || !matches!( state.phase, SessionState::Idle )
                || self.inner.queue.is_empty()
            {
                tracing::warn!( "Play called but operated nothing" );
                return;
            }
            let Some( item ) = self.inner.queue.get( 0 ) else {
                return;
            };

            state.last_attempt += 1;
            let attempt = state.last_attempt;
            let cancel = CancellationToken::new();
            state.phase = SessionState::Preparing { attempt, cancel: cancel.clone() };
            state.current = Some( item.source.clone() );
            ( attempt, cancel, item )
        };

        tracing::info!( "Play called" );
        self.inner.events.emit( PlaybackEvent::PlayPreparing { seek } );

        if let Err( e ) = self.prepare_and_start( attempt, &cancel, &item, seek, quiet ).await {
            if self.inner.state.lock().phase.is_active( attempt ) {
                let this = self.clone();
                tokio::spawn( async move { this.handle_error( e, attempt ).await } );
            } else {
                tracing::debug!( "Dropping error from abandoned attempt: {}", e );
            }
        }
    }


    async fn prepare_and_start(
        &self,
        attempt: u64,
        cancel: &CancellationToken,
        item: &QueueItem,
        seek: u64,
        quiet: bool,
    ) -> Result<(), PlaybackError> {
        let source = &item.source;

        if source.awaiting_live() {
            if !self.wait_for_live( attempt, cancel, source, quiet ).await {
                return Ok(());
            }
        } else if !quiet {
            self.notify( Notification::Preparing {
                title: source.title().to_string(),
                length_seconds: source.length_seconds(),
                is_live: source.is_live_stream(),
            }).await;
        }

        self.start_session( attempt, cancel, item, seek, quiet ).await
    }


    /// Parks the attempt until `source` goes live. Returns false when the
    /// wait was canceled.
    async fn wait_for_live(
        &self,
        attempt: u64,
        cancel: &CancellationToken,
        source: &Arc<dyn AudioSource>,
        quiet: bool,
    ) -> bool {
        if !quiet {
            self.notify( Notification::WaitingForLive { title: source.title().to_string() } ).await;
        }
        {
            let mut state = self.inner.state.lock();
            if !state.phase.is_active( attempt ) {
                return false;
            }
            state.phase = SessionState::WaitingForLive { attempt, cancel: cancel.clone() };
        }
        tracing::info!( "Waiting for {} to go live", source.url() );

        let queue = &self.inner.queue;
        let outcome = self.inner.live.wait( source.as_ref(), cancel, || {
            queue.get( 0 ).map_or( true, |head| !Arc::ptr_eq( &head.source, source ) )
        }).await;

        let proceed = {
            let mut state = self.inner.state.lock();
            let active = state.phase.is_active( attempt );
            match outcome {
                LiveWaitOutcome::Live if active => {
                    state.phase = SessionState::Preparing { attempt, cancel: cancel.clone() };
                    true
                }
                LiveWaitOutcome::Live => false,
                LiveWaitOutcome::Canceled => {
                    if active {
                        state.phase = SessionState::Idle;
                    }
                    false
                }
            }
        };

        if outcome == LiveWaitOutcome::Canceled {
            tracing::info!( "Live wait canceled" );
            if !quiet {
                self.notify( Notification::WaitingCanceled ).await;
            }
        }
        proceed
    }


    async fn start_session(
        &self,
        attempt: u64,
        cancel: &CancellationToken,
        item: &QueueItem,
        seek: u64,
        quiet: bool,
    ) -> Result<(), PlaybackError> {
        let source = &item.source;
        let seek = if source.length_seconds() <= seek { 0 } else { seek };

        let options = {
            let mut state = self.inner.state.lock();
            state.seek = seek;
            ResolveOptions {
                effect_args: state.effect_args.clone(),
                seek_seconds: seek,
                volume_transform_enabled: state.volume != 100,
                bitrate: state.connection.as_ref().map_or( 0, |c| c.bitrate() ),
            }
        };

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            resolved = self.inner.resolver.resolve( source.as_ref(), &options ) => resolved?,
        };

        let ( engine, resource ) = {
            let mut state = self.inner.state.lock();
            if !state.phase.is_active( attempt ) {
                release_deferred( resolved.stream );
                return Ok(());
            }
            if !state.is_connected() {
                tracing::warn!( "Voice connection went away while resolving" );
                release_deferred( resolved.stream );
                state.phase = SessionState::Idle;
                return Ok(());
            }

            let engine = self.prepare_engine( &mut state )?;
            let volume = options.volume_transform_enabled
                .then( || VolumeHandle::new( f32::from( state.volume ) / 100.0 ) );
            state.release_stream();
            state.session = Some( PlaybackSession {
                stream: resolved.stream.clone(),
                container: resolved.container,
                cost: resolved.cost,
                volume: volume.clone(),
            });
            state.paused_by = None;

            let resource = AudioResource {
                stream: resolved.stream.clone(),
                container: resolved.container,
                volume,
                length: Duration::from_secs( source.length_seconds().saturating_sub( seek ) ),
            };
            ( engine, resource )
        };

        self.watch_stream_end( attempt, cancel.clone(), resolved.stream );
        engine.play( resource )?;
        self.apply_volume();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            started = engine.wait_for( PlayerStatus::Playing, self.inner.config.start_timeout() ) => started?,
        }

        {
            let mut state = self.inner.state.lock();
            if !state.phase.is_active( attempt ) {
                return Ok(());
            }
            state.phase = SessionState::Playing { attempt, cancel: cancel.clone() };
        }
        self.inner.events.emit( PlaybackEvent::PlayStarted );
        tracing::info!( "Play started successfully" );

        if !quiet {
            self.notify( Notification::NowPlaying( NowPlaying::build( item, self.inner.queue.as_ref() ) ) ).await;
        }

        if self.inner.queue.mix_playlist_enabled() {
            self.inner.queue.prepare_next_mix_item().await?;
        }
        Ok(())
    }


    /// Returns the engine for the attached connection, creating it on first use.
    fn prepare_engine( &self, state: &mut ControllerState ) -> Result<Arc<PlaybackEngine>, PlaybackError> {
        if let Some( engine ) = &state.engine {
            return Ok( engine.clone() );
        }
        let connection = state.connection.as_ref()
            .ok_or_else( || PlaybackError::Player( "No voice connection".into() ) )?;

        let engine = Arc::new( PlaybackEngine::new( connection.create_player() ) );
        self.spawn_engine_pump( &engine );
        state.engine = Some( engine.clone() );
        Ok( engine )
    }


    fn spawn_engine_pump( &self, engine: &PlaybackEngine ) {
        let mut events = engine.subscribe();
        let shutdown = engine.shutdown_token();
        let weak = Arc::downgrade( &self.inner );

        tokio::spawn( async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok( event ) => {
                        let Some( this ) = Self::from_weak( &weak ) else { break };
                        this.on_engine_event( event );
                    }
                    Err( broadcast::error::RecvError::Lagged( skipped ) ) => {
                        tracing::warn!( "Engine event pump lagged by {} events", skipped );
                    }
                    Err( broadcast::error::RecvError::Closed ) => break,
                }
            }
        });
    }


    fn on_engine_event( &self, event: EngineEvent ) {
        match event {
            EngineEvent::StateChanged { old, new }
                if old.status == PlayerStatus::Playing && new.status == PlayerStatus::Idle =>
            {
                let error_count = {
                    let state = self.inner.state.lock();
                    state.current.as_ref().map_or( 0, |s| state.retry.count_for( s.url() ) )
                };
                self.inner.events.emit( PlaybackEvent::ReportPlaybackDuration {
                    duration: old.playback_duration,
                    error_count,
                });
            }
            EngineEvent::StateChanged { .. } => {}
            EngineEvent::Error( e ) => {
                let attempt = self.inner.state.lock().phase.active_attempt();
                match attempt {
                    Some( attempt ) => {
                        let this = self.clone();
                        tokio::spawn( async move { this.handle_error( e, attempt ).await } );
                    }
                    None => tracing::debug!( "Ignoring player error outside a session: {}", e ),
                }
            }
        }
    }


    fn watch_stream_end( &self, attempt: u64, cancel: CancellationToken, stream: Arc<dyn AudioStream> ) {
        let weak = Arc::downgrade( &self.inner );
        tokio::spawn( async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = stream.finished() => {
                    if let Some( this ) = Self::from_weak( &weak ) {
                        this.on_stream_finished( attempt ).await;
                    }
                }
            }
        });
    }


    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    async fn on_stream_finished( &self, attempt: u64 ) {
        let anomaly = {
            let mut state = self.inner.state.lock();
            let playing = matches!( state.phase, SessionState::Playing { attempt: a, .. } if a == attempt );
            let preparing = matches!( state.phase, SessionState::Preparing { attempt: a, .. } if a == attempt );
            if playing && state.current.is_some() {
                state.phase = SessionState::Completed { attempt };
                false
            } else if preparing {
                true
            } else {
                return;
            }
        };
        if anomaly {
            self.handle_error( PlaybackError::UnexpectedEnd, attempt ).await;
            return;
        }
        tracing::info!( "onStreamFinished called" );

        let engine = {
            let state = self.inner.state.lock();
            state.engine.clone().filter( |_| state.is_connected() )
        };
        if let Some( engine ) = engine {
            if engine.status() == PlayerStatus::Playing {
                let drained = engine.wait_for( PlayerStatus::Idle, self.inner.config.finish_timeout() ).await;
                if drained.is_err() {
                    tracing::warn!( "Stream has not ended in time and will force stream into destroying" );
                    engine.stop( true );
                }
            }
        }

        tracing::info!( "Stream finished" );
        self.inner.events.emit( PlaybackEvent::PlayCompleted );
        {
            let mut state = self.inner.state.lock();
            state.retry.reset();
            state.release_stream();
        }

        let queue = &self.inner.queue;
        if queue.loop_enabled() {
            if self.settle_completed( attempt ) {
                self.play_boxed( 0, false ).await;
            }
            return;
        }
        if queue.once_loop_enabled() {
            queue.set_once_loop_enabled( false );
            if self.settle_completed( attempt ) {
                self.play_boxed( 0, false ).await;
            }
            return;
        }

        queue.next().await;
        if !self.settle_completed( attempt ) {
            return;
        }
        if queue.is_empty() {
            self.on_queue_empty().await;
        } else {
            self.play_boxed( 0, false ).await;
        }
    }


    /// Moves a completed session to `Idle`. False if something else (a
    /// stop or a disconnect) already took over.
    fn settle_completed( &self, attempt: u64 ) -> bool {
        let mut state = self.inner.state.lock();
        let completed = matches!( state.phase, SessionState::Completed { attempt: a } if a == attempt );
        if completed {
            state.phase = SessionState::Idle;
        } else {
            tracing::debug!( "Session was stopped while completing" );
        }
        completed
    }


    /// Absorbs a failure of `attempt`. Failures of anything but the
    /// current session are dropped.
    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    async fn handle_error( &self, error: PlaybackError, attempt: u64 ) {
        let skipping = {
            let mut state = self.inner.state.lock();
            if !state.phase.is_active( attempt ) {
                tracing::debug!( "Dropping error from a finished session: {}", error );
                return;
            }
            let old = mem::replace( &mut state.phase, SessionState::Failed { attempt } );
            old.cancel();

            let failures = state.current.as_ref().map_or( 0, |s| state.retry.count_for( s.url() ) );
            failures + 1 >= self.inner.config.retry_limit
        };

        tracing::error!( "{}", error );
        self.inner.events.emit( PlaybackEvent::HandledError { message: error.to_string() } );

        if error.is_workaround() {
            self.on_stream_failed( attempt, true ).await;
            return;
        }
        self.notify( Notification::PlaybackFailed { skipping } ).await;
        self.on_stream_failed( attempt, false ).await;
    }


    async fn on_stream_failed( &self, attempt: u64, quiet: bool ) {
        tracing::info!( "onStreamFailed called" );
        self.inner.events.emit( PlaybackEvent::PlayFailed );

        let outcome = {
            let mut state = self.inner.state.lock();
            if !matches!( state.phase, SessionState::Failed { attempt: a } if a == attempt ) {
                tracing::debug!( "Session was stopped before its failure was handled" );
                return;
            }
            state.release_stream();
            match state.current.clone() {
                Some( source ) => {
                    let fresh = state.retry.record_failure( source.url(), quiet );
                    Some(( source, fresh, state.retry.count ))
                }
                None => None,
            }
        };

        let Some(( source, fresh, count )) = outcome else {
            self.stop( true, false ).await;
            return;
        };
        if fresh {
            source.purge_cache();
        }
        tracing::warn!( "Play failed ({} times)", count );
        self.stop( true, false ).await;

        let queue = &self.inner.queue;
        if count >= self.inner.config.retry_limit {
            tracing::warn!( "Giving up on {} after {} failures", source.url(), count );
            if queue.loop_enabled() {
                queue.set_loop_enabled( false );
            }
            if queue.len() == 1 && queue.queue_loop_enabled() {
                queue.set_queue_loop_enabled( false );
            }
            queue.next().await;
            self.inner.state.lock().retry.reset();

            if queue.is_empty() {
                self.on_queue_empty().await;
                return;
            }
        }
        self.play_boxed( 0, quiet ).await;
    }


    /// Releases the stream, tells the text surface, and arms the idle
    /// disconnect timer.
    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    async fn on_queue_empty( &self ) {
        tracing::info!( "Queue empty" );
        {
            let mut state = self.inner.state.lock();
            state.release_stream();

            // Must be armed before the notice so a racing play can disarm it
            if matches!( state.phase, SessionState::Idle ) && self.inner.queue.is_empty() {
                let weak = Arc::downgrade( &self.inner );
                state.idle_timer = Some( IdleTimer::arm( self.inner.config.idle_timeout(), move |token| async move {
                    if let Some( this ) = Self::from_weak( &weak ) {
                        this.on_idle_timeout( token ).await;
                    }
                }));
            }
        }
        self.notify( Notification::QueueEmpty ).await;
    }


    async fn on_idle_timeout( &self, token: CancellationToken ) {
        let playing = {
            let mut state = self.inner.state.lock();
            if token.is_cancelled() {
                return;
            }
            state.idle_timer = None;
            state.is_playing()
        };
        if playing {
            return;
        }
        tracing::info!( guild = %self.inner.guild_id, "Idle for too long, leaving" );
        self.notify( Notification::QueueEmptyExiting ).await;
        self.disconnect().await;
    }


    /// Stops the current session.
    ///
    /// Cancels any live wait or pending preparation. With `wait`, blocks
    /// until the player is idle, forcing it if it does not get there within
    /// the stop timeout.
    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    pub async fn stop( &self, force: bool, wait: bool ) {
        tracing::info!( "Stop called" );
        let engine = {
            let mut state = self.inner.state.lock();
            let old = mem::replace( &mut state.phase, SessionState::Idle );
            old.cancel();
            state.release_stream();
            state.engine.clone()
        };

        if let Some( engine ) = engine {
            engine.unpause();
            engine.stop( force );
            if wait && engine.wait_for( PlayerStatus::Idle, self.inner.config.stop_timeout() ).await.is_err() {
                tracing::warn!( "Player did not stop in time, forcing" );
                engine.stop( true );
            }
        }
        self.inner.events.emit( PlaybackEvent::Stop );
    }


    /// Stops playback and leaves the voice channel.
    #[tracing::instrument( skip_all, fields( guild = %self.inner.guild_id ) )]
    pub async fn disconnect( &self ) {
        self.stop( false, false ).await;
        self.inner.events.emit( PlaybackEvent::DisconnectAttempt );

        let connection = {
            let mut state = self.inner.state.lock();
            state.idle_timer = None;
            state.connection.take()
        };
        match connection {
            Some( connection ) => {
                tracing::info!( "Disconnected from {}", connection.channel_id() );
                connection.disconnect();
                self.inner.events.emit( PlaybackEvent::Disconnect );
            }
            None => tracing::warn!( "Disconnect called but no connection exists" ),
        }

        let mut state = self.inner.state.lock();
        state.release_stream();
        state.current = None;
        state.seek = 0;
        state.engine = None;
        state.paused_by = None;
    }


    /// Pauses playback on behalf of `requestor`, who is then the only one
    /// allowed to resume it.
    pub fn pause( &self, requestor: Option<&str> ) {
        tracing::info!( guild = %self.inner.guild_id, "Pause called" );
        self.inner.events.emit( PlaybackEvent::Pause );
        let mut state = self.inner.state.lock();
        if let Some( engine ) = &state.engine {
            engine.pause();
        }
        state.paused_by = requestor.map( str::to_string );
    }


    /// Resumes playback. Returns false when `requestor` is not the one who
    /// paused it.
    pub fn resume( &self, requestor: Option<&str> ) -> bool {
        tracing::info!( guild = %self.inner.guild_id, "Resume called" );
        self.inner.events.emit( PlaybackEvent::Resume );
        let mut state = self.inner.state.lock();
        let allowed = requestor.map_or( true, |id| state.paused_by.as_deref() == Some( id ) );
        if !allowed {
            return false;
        }
        if let Some( engine ) = &state.engine {
            engine.unpause();
        }
        state.paused_by = None;
        true
    }


    /// Restarts the head of the queue from the beginning.
    pub async fn rewind( &self ) {
        tracing::info!( guild = %self.inner.guild_id, "Rewind called" );
        self.inner.events.emit( PlaybackEvent::Rewind );
        self.stop( false, true ).await;
        self.play_boxed( 0, false ).await;
    }


    async fn notify( &self, notification: Notification ) {
        let Some( notifier ) = &self.inner.notifier else {
            return;
        };
        if let Err( e ) = notifier.notify( notification ).await {
            tracing::warn!( guild = %self.inner.guild_id, "Failed to send notification: {}", e );
        }
    }
}


impl fmt::Debug for PlaybackController {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct( "PlaybackController" )
            .field( "guild_id", &self.inner.guild_id )
            .field( "phase", &state.phase.phase() )
            .field( "current", &state.current.as_ref().map( |s| s.url().to_string() ) )
            .field( "volume", &state.volume )
            .finish()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    use async_trait::async_trait;

    use crate::error::NotifyError;
    use crate::queue::PlayQueue;
    use crate::testing::{
        drain, expect_event, settle, MockConnection, MockPlayer, MockResolver, MockSource, RecordingNotifier,
    };


    const SOON: Duration = Duration::from_secs( 60 );


    struct Harness {
        controller: PlaybackController,
        queue: Arc<PlayQueue>,
        sources: Vec<Arc<MockSource>>,
        resolver: Arc<MockResolver>,
        player: Arc<MockPlayer>,
        connection: Arc<MockConnection>,
        notifier: Arc<RecordingNotifier>,
        events: broadcast::Receiver<PlaybackEvent>,
    }


    fn harness_with( sources: Vec<MockSource> ) -> Harness {
        let queue = Arc::new( PlayQueue::new() );
        let sources: Vec<Arc<MockSource>> = sources.into_iter().map( Arc::new ).collect();
        for source in &sources {
            queue.add( QueueItem::new( source.clone(), "alice" ) );
        }

        let resolver = Arc::new( MockResolver::new() );
        let notifier = Arc::new( RecordingNotifier::new() );
        let player = Arc::new( MockPlayer::new() );
        let connection = Arc::new( MockConnection::new( player.clone() ) );

        let port: Arc<dyn NotificationPort> = notifier.clone();
        let controller = PlaybackController::new(
            "guild-1",
            PlaybackConfig::default(),
            queue.clone(),
            resolver.clone(),
            Some( port ),
        );
        controller.attach_connection( connection.clone() );
        let events = controller.subscribe();

        Harness { controller, queue, sources, resolver, player, connection, notifier, events }
    }


    fn harness( urls: &[&str] ) -> Harness {
        harness_with( urls.iter().map( |url| MockSource::new( url, 180 ) ).collect() )
    }


    impl Harness {
        /// Ends the latest stream the way a real player would: it drains,
        /// goes idle, and the stream reports EOF.
        fn finish_current( &self ) {
            self.player.report_idle();
            self.resolver.last_stream().unwrap().end();
        }


        fn resolved_urls( &self ) -> Vec<String> {
            self.resolver.calls().into_iter().map( |( url, _ )| url ).collect()
        }


        fn queued_urls( &self ) -> Vec<String> {
            self.queue.items().iter().map( |item| item.source.url().to_string() ).collect()
        }


        fn event_names( &mut self ) -> Vec<&'static str> {
            drain( &mut self.events ).iter().map( PlaybackEvent::name ).collect()
        }


        fn failures( &self ) -> Vec<bool> {
            self.notifier.sent().into_iter()
                .filter_map( |n| match n {
                    Notification::PlaybackFailed { skipping } => Some( skipping ),
                    _ => None,
                })
                .collect()
        }


        fn count( &self, pred: impl Fn( &Notification ) -> bool ) -> usize {
            self.notifier.count( pred )
        }
    }


    fn is_started( event: &PlaybackEvent ) -> bool {
        *event == PlaybackEvent::PlayStarted
    }


    #[test]
    fn test_retry_state_accounting() {
        let mut retry = RetryState::default();
        assert!( retry.record_failure( "a", false ) );
        assert!( !retry.record_failure( "a", false ) );
        assert_eq!( retry.count, 2 );
        assert_eq!( retry.count_for( "a" ), 2 );

        assert!( retry.record_failure( "b", false ) );
        assert_eq!( retry.count, 1 );
        assert_eq!( retry.count_for( "a" ), 0 );

        // Quiet failures restart the count even for the same source
        retry.record_failure( "b", false );
        assert!( retry.record_failure( "b", true ) );
        assert_eq!( retry.count, 1 );

        retry.reset();
        assert_eq!( retry, RetryState::default() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_starts_head_of_queue() {
        let mut h = harness( &[ "a", "b" ] );
        h.controller.play( 0, false ).await;

        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
        assert!( h.controller.is_playing() );
        assert!( !h.controller.is_preparing() );
        assert_eq!( h.controller.cost(), 1 );
        assert_eq!( h.controller.container(), Some( ContainerType::OggOpus ) );
        assert_eq!( h.controller.current_source().unwrap().url(), "a" );
        assert_eq!( h.event_names(), vec![ "playCalled", "playPreparing", "playStarted" ] );

        let sent = h.notifier.sent();
        assert_eq!( sent[ 0 ], Notification::Preparing { title: "a".into(), length_seconds: 180, is_live: false } );
        match &sent[ 1 ] {
            Notification::NowPlaying( np ) => {
                assert_eq!( np.title, "a" );
                assert_eq!( np.next_title.as_deref(), Some( "b" ) );
            }
            other => panic!( "unexpected notification {:?}", other ),
        }

        let ( _, options ) = &h.resolver.calls()[ 0 ];
        assert_eq!( options.bitrate, 96_000 );
        assert_eq!( options.seek_seconds, 0 );
        assert!( !options.volume_transform_enabled );
        assert_eq!( h.player.play_count(), 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_while_busy_is_rejected() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        drain( &mut h.events );

        h.controller.play( 0, false ).await;
        assert_eq!( h.event_names(), vec![ "playCalled" ] );
        assert_eq!( h.resolver.call_count(), 1 );
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_needs_connection_and_items() {
        let h = harness( &[] );
        h.controller.play( 0, false ).await;
        assert_eq!( h.resolver.call_count(), 0 );
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );

        let h = harness( &[ "a" ] );
        h.connection.set_ready( false );
        h.controller.play( 0, false ).await;
        assert_eq!( h.resolver.call_count(), 0 );
        assert!( !h.controller.is_connected() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_seek_past_end_starts_from_zero() {
        let h = harness( &[ "a" ] );
        h.controller.play( 200, false ).await;
        assert_eq!( h.resolver.calls()[ 0 ].1.seek_seconds, 0 );

        h.controller.stop( false, true ).await;
        h.controller.play( 30, false ).await;
        assert_eq!( h.resolver.calls()[ 1 ].1.seek_seconds, 30 );
        assert_eq!( h.player.last_resource().unwrap().length, Duration::from_secs( 150 ) );

        h.player.reporter().unwrap().set_playback_duration( Duration::from_secs( 12 ) );
        assert_eq!( h.controller.current_time(), Duration::from_secs( 42 ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_track_loop_replays_same_item() {
        let mut h = harness( &[ "a", "b" ] );
        h.queue.set_loop_enabled( true );
        h.resolver.fail_times( 1, PlaybackError::Resolve( "flaky".into() ) );
        h.controller.play( 0, false ).await;
        expect_event( &mut h.events, SOON, is_started ).await;
        settle().await;
        drain( &mut h.events );
        assert_eq!( h.controller.retry_state().count, 1 );

        h.finish_current();
        expect_event( &mut h.events, SOON, is_started ).await;
        settle().await;

        assert_eq!( h.resolved_urls(), vec![ "a", "a", "a" ] );
        assert_eq!( h.queue.len(), 2 );
        assert_eq!( h.controller.retry_state(), RetryState::default() );
        assert!( !h.controller.finish_timeout() );
        let streams = h.resolver.streams();
        assert!( streams[ 0 ].is_destroyed() );
        assert!( !streams[ 1 ].is_destroyed() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_advances_and_releases_previous_stream() {
        let mut h = harness( &[ "a", "b" ] );
        h.controller.play( 0, false ).await;

        h.finish_current();
        expect_event( &mut h.events, SOON, |e| *e == PlaybackEvent::PlayCompleted ).await;
        expect_event( &mut h.events, SOON, is_started ).await;
        settle().await;

        assert_eq!( h.resolved_urls(), vec![ "a", "b" ] );
        assert_eq!( h.queued_urls(), vec![ "b" ] );
        let streams = h.resolver.streams();
        assert!( streams[ 0 ].is_destroyed() );
        assert!( !streams[ 1 ].is_destroyed() );
        assert_eq!( h.controller.retry_state(), RetryState::default() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_once_loop_replays_one_time() {
        let mut h = harness( &[ "a" ] );
        h.queue.set_once_loop_enabled( true );
        h.controller.play( 0, false ).await;
        drain( &mut h.events );

        h.finish_current();
        expect_event( &mut h.events, SOON, is_started ).await;
        assert!( !h.queue.once_loop_enabled() );

        h.finish_current();
        expect_event( &mut h.events, SOON, |e| *e == PlaybackEvent::PlayCompleted ).await;
        settle().await;
        assert_eq!( h.resolved_urls(), vec![ "a", "a" ] );
        assert!( h.queue.is_empty() );
        assert_eq!( h.count( |n| *n == Notification::QueueEmpty ), 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_empty_queue_disconnects_after_idle_timeout() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        h.finish_current();
        settle().await;

        assert!( h.controller.finish_timeout() );
        assert_eq!( h.count( |n| *n == Notification::QueueEmpty ), 1 );

        tokio::time::sleep( Duration::from_secs( 590 ) ).await;
        assert_eq!( h.connection.disconnect_count(), 0 );

        expect_event( &mut h.events, SOON, |e| *e == PlaybackEvent::Disconnect ).await;
        assert_eq!( h.count( |n| *n == Notification::QueueEmptyExiting ), 1 );
        assert_eq!( h.connection.disconnect_count(), 1 );
        assert!( !h.controller.is_connected() );
        assert!( !h.controller.finish_timeout() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_disarms_idle_timer() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        h.finish_current();
        settle().await;
        assert!( h.controller.finish_timeout() );

        drain( &mut h.events );

        h.queue.add( QueueItem::new( MockSource::arc( "b", 900 ), "bob" ) );
        h.controller.play( 0, false ).await;
        expect_event( &mut h.events, SOON, is_started ).await;
        assert!( !h.controller.finish_timeout() );

        tokio::time::sleep( Duration::from_secs( 700 ) ).await;
        assert_eq!( h.connection.disconnect_count(), 0 );
        assert_eq!( h.count( |n| *n == Notification::QueueEmptyExiting ), 0 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_disconnect_disarms_idle_timer() {
        let h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        h.finish_current();
        settle().await;
        assert!( h.controller.finish_timeout() );

        h.controller.disconnect().await;
        assert_eq!( h.connection.disconnect_count(), 1 );
        assert!( !h.controller.finish_timeout() );

        tokio::time::sleep( Duration::from_secs( 700 ) ).await;
        assert_eq!( h.connection.disconnect_count(), 1 );
        assert_eq!( h.count( |n| *n == Notification::QueueEmptyExiting ), 0 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_retry_exhaustion_skips_once_and_clears_loop() {
        let mut h = harness( &[ "a", "b" ] );
        h.queue.set_loop_enabled( true );
        h.resolver.fail_times( 3, PlaybackError::Resolve( "410 Gone".into() ) );

        h.controller.play( 0, false ).await;
        expect_event( &mut h.events, SOON, is_started ).await;

        assert_eq!( h.resolved_urls(), vec![ "a", "a", "a", "b" ] );
        assert_eq!( h.queued_urls(), vec![ "b" ] );
        assert!( !h.queue.loop_enabled() );
        assert_eq!( h.failures(), vec![ false, false, true ] );
        assert_eq!( h.sources[ 0 ].purge_count(), 1 );
        assert_eq!( h.controller.current_source().unwrap().url(), "b" );
    }


    #[tokio::test( start_paused = true )]
    async fn test_recovered_source_reports_its_failures() {
        let mut h = harness( &[ "a" ] );
        h.resolver.fail_times( 2, PlaybackError::Resolve( "timeout".into() ) );

        h.controller.play( 0, false ).await;
        expect_event( &mut h.events, SOON, is_started ).await;
        assert_eq!( h.failures(), vec![ false, false ] );
        assert_eq!( h.controller.retry_state(), RetryState { count: 2, last_url: Some( "a".into() ) } );

        h.player.reporter().unwrap().set_playback_duration( Duration::from_secs( 42 ) );
        h.player.report_idle();
        let report = expect_event( &mut h.events, SOON, |e| matches!( e, PlaybackEvent::ReportPlaybackDuration { .. } ) ).await;
        assert_eq!( report, PlaybackEvent::ReportPlaybackDuration {
            duration: Duration::from_secs( 42 ),
            error_count: 2,
        });
    }


    #[tokio::test( start_paused = true )]
    async fn test_exhaustion_on_last_item_empties_queue_once() {
        let h = harness( &[ "a" ] );
        h.queue.set_queue_loop_enabled( true );
        h.resolver.fail_times( 3, PlaybackError::Resolve( "403".into() ) );

        h.controller.play( 0, false ).await;
        settle().await;

        assert_eq!( h.resolver.call_count(), 3 );
        assert!( h.queue.is_empty() );
        assert!( !h.queue.queue_loop_enabled() );
        assert_eq!( h.count( |n| *n == Notification::QueueEmpty ), 1 );
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert!( h.controller.finish_timeout() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_workaround_retries_quietly() {
        let mut h = harness( &[ "a" ] );
        h.resolver.fail_times( 1, PlaybackError::Workaround( "connection reset".into() ) );

        h.controller.play( 0, false ).await;
        expect_event( &mut h.events, SOON, |e| matches!( e, PlaybackEvent::HandledError { .. } ) ).await;
        expect_event( &mut h.events, SOON, is_started ).await;

        assert!( h.failures().is_empty() );
        assert_eq!( h.count( |n| matches!( n, Notification::Preparing { .. } ) ), 1 );
        assert_eq!( h.count( |n| matches!( n, Notification::NowPlaying( _ ) ) ), 0 );
        assert_eq!( h.controller.retry_state().count, 1 );
        assert_eq!( h.sources[ 0 ].purge_count(), 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_start_timeout_is_retried() {
        let mut h = harness( &[ "a" ] );
        h.player.set_auto_start( false );

        let started = tokio::time::Instant::now();
        h.controller.play( 0, false ).await;
        assert!( started.elapsed() >= Duration::from_secs( 10 ) );

        h.player.set_auto_start( true );
        expect_event( &mut h.events, SOON, is_started ).await;
        assert_eq!( h.resolver.call_count(), 2 );
        assert_eq!( h.player.play_count(), 2 );
        assert_eq!( h.failures(), vec![ false ] );
    }


    #[tokio::test( start_paused = true )]
    async fn test_player_error_during_playback_is_retried() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;

        h.player.reporter().unwrap().error( PlaybackError::Player( "decoder crashed".into() ) );
        let handled = expect_event( &mut h.events, SOON, |e| matches!( e, PlaybackEvent::HandledError { .. } ) ).await;
        assert_eq!( handled, PlaybackEvent::HandledError { message: "Audio player error: decoder crashed".into() } );
        expect_event( &mut h.events, SOON, is_started ).await;

        assert_eq!( h.resolver.call_count(), 2 );
        assert_eq!( h.controller.retry_state().count, 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_stream_end_while_preparing_is_an_error() {
        let mut h = harness( &[ "a" ] );
        h.player.set_auto_start( false );

        let controller = h.controller.clone();
        let first = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        assert!( h.controller.is_preparing() );

        h.player.set_auto_start( true );
        h.resolver.last_stream().unwrap().end();
        let handled = expect_event( &mut h.events, SOON, |e| matches!( e, PlaybackEvent::HandledError { .. } ) ).await;
        assert_eq!( handled, PlaybackEvent::HandledError { message: PlaybackError::UnexpectedEnd.to_string() } );
        expect_event( &mut h.events, SOON, is_started ).await;
        first.await.unwrap();

        assert_eq!( h.resolver.call_count(), 2 );
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
    }


    #[tokio::test( start_paused = true )]
    async fn test_stop_cancels_live_wait() {
        let h = harness_with( vec![ MockSource::new( "live", 0 ).scheduled() ] );

        let controller = h.controller.clone();
        let waiting = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        assert!( h.controller.is_waiting() );
        assert!( h.controller.is_playing() );

        // Rejected while the wait is pending
        h.controller.play( 0, false ).await;

        h.controller.stop( false, false ).await;
        waiting.await.unwrap();
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert!( !h.controller.is_waiting() );
        assert!( !h.controller.is_preparing() );
        assert_eq!( h.resolver.call_count(), 0 );
        assert_eq!( h.count( |n| matches!( n, Notification::WaitingForLive { .. } ) ), 1 );
        assert_eq!( h.count( |n| *n == Notification::WaitingCanceled ), 1 );

        h.sources[ 0 ].go_live();
        h.controller.play( 0, false ).await;
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
        assert_eq!( h.resolver.call_count(), 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_live_wait_proceeds_once_live() {
        let h = harness_with( vec![ MockSource::new( "live", 0 ).scheduled() ] );

        let controller = h.controller.clone();
        let waiting = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        assert_eq!( h.controller.state(), PlaybackPhase::WaitingForLive );

        h.sources[ 0 ].go_live();
        waiting.await.unwrap();
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
        assert_eq!( h.count( |n| matches!( n, Notification::Preparing { .. } ) ), 0 );
        assert_eq!( h.count( |n| matches!( n, Notification::NowPlaying( _ ) ) ), 1 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_live_wait_ends_when_head_changes() {
        let h = harness_with( vec![ MockSource::new( "live", 0 ).scheduled(), MockSource::new( "b", 180 ) ] );

        let controller = h.controller.clone();
        let waiting = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        assert!( h.controller.is_waiting() );

        h.queue.remove( 0 );
        waiting.await.unwrap();
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert_eq!( h.count( |n| *n == Notification::WaitingCanceled ), 1 );

        h.controller.play( 0, false ).await;
        assert_eq!( h.controller.current_source().unwrap().url(), "b" );
    }


    #[tokio::test( start_paused = true )]
    async fn test_stop_then_play_keeps_one_session() {
        let h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        h.controller.stop( false, false ).await;
        assert_eq!( h.controller.cost(), 0 );

        h.controller.play( 0, false ).await;
        settle().await;
        let streams = h.resolver.streams();
        assert_eq!( streams.len(), 2 );
        assert!( streams[ 0 ].is_destroyed() );
        assert!( !streams[ 1 ].is_destroyed() );

        // A late end from the first session changes nothing
        streams[ 0 ].end();
        settle().await;
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
        assert_eq!( h.resolver.call_count(), 2 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_stop_releases_session_stream() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        drain( &mut h.events );
        assert_eq!( h.controller.container(), Some( ContainerType::OggOpus ) );

        h.controller.stop( false, true ).await;
        settle().await;
        assert!( h.resolver.streams()[ 0 ].is_destroyed() );
        assert_eq!( h.controller.container(), None );
        assert_eq!( h.controller.cost(), 0 );
        assert!( h.event_names().contains( &"stop" ) );
    }


    struct StallingNotifier;

    #[async_trait]
    impl NotificationPort for StallingNotifier {
        async fn notify( &self, notification: Notification ) -> Result<(), NotifyError> {
            if notification == Notification::QueueEmpty {
                tokio::time::sleep( Duration::from_secs( 2 ) ).await;
            }
            Ok(())
        }
    }


    #[tokio::test( start_paused = true )]
    async fn test_play_during_queue_empty_notice_keeps_timer_disarmed() {
        let queue = Arc::new( PlayQueue::new() );
        queue.add( QueueItem::new( MockSource::arc( "a", 180 ), "alice" ) );
        let resolver = Arc::new( MockResolver::new() );
        let player = Arc::new( MockPlayer::new() );
        let notifier: Arc<dyn NotificationPort> = Arc::new( StallingNotifier );
        let controller = PlaybackController::new(
            "guild-1",
            PlaybackConfig::default(),
            queue.clone(),
            resolver.clone(),
            Some( notifier ),
        );
        controller.attach_connection( Arc::new( MockConnection::new( player.clone() ) ) );
        controller.play( 0, false ).await;

        player.report_idle();
        resolver.last_stream().unwrap().end();
        tokio::time::sleep( Duration::from_millis( 500 ) ).await;
        assert!( queue.is_empty() );
        assert!( controller.finish_timeout() );

        queue.add( QueueItem::new( MockSource::arc( "b", 180 ), "alice" ) );
        controller.play( 0, false ).await;
        assert_eq!( controller.state(), PlaybackPhase::Playing );

        tokio::time::sleep( Duration::from_secs( 5 ) ).await;
        assert_eq!( controller.state(), PlaybackPhase::Playing );
        assert!( !controller.finish_timeout() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_stop_abandons_pending_resolve() {
        let h = harness( &[ "a" ] );
        h.resolver.set_delay( Duration::from_secs( 5 ) );

        let controller = h.controller.clone();
        let pending = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        assert!( h.controller.is_preparing() );

        h.controller.stop( false, false ).await;
        pending.await.unwrap();
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert!( h.resolver.streams().is_empty() );
        assert_eq!( h.player.play_count(), 0 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_connection_lost_while_resolving() {
        let h = harness( &[ "a" ] );
        h.resolver.set_delay( Duration::from_secs( 5 ) );

        let controller = h.controller.clone();
        let pending = tokio::spawn( async move { controller.play( 0, false ).await } );
        settle().await;
        h.connection.set_ready( false );

        pending.await.unwrap();
        settle().await;
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert!( h.resolver.streams()[ 0 ].is_destroyed() );
        assert_eq!( h.player.play_count(), 0 );
    }


    #[tokio::test( start_paused = true )]
    async fn test_slow_drain_is_forced() {
        let mut h = harness( &[ "a", "b" ] );
        h.controller.play( 0, false ).await;
        drain( &mut h.events );

        h.resolver.last_stream().unwrap().end();
        settle().await;
        assert_eq!( h.controller.state(), PlaybackPhase::Completed );

        tokio::time::sleep( h.controller.config().finish_timeout() + Duration::from_secs( 5 ) ).await;
        assert!( h.player.stop_count() >= 1 );
        assert_eq!( h.resolved_urls(), vec![ "a", "b" ] );
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );

        // Forcing the drain is not a controller stop
        let names = h.event_names();
        assert!( names.contains( &"playCompleted" ) );
        assert!( names.contains( &"playStarted" ) );
        assert!( !names.contains( &"stop" ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_pause_is_locked_to_requestor() {
        let h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;

        h.controller.pause( Some( "alice" ) );
        assert!( h.controller.is_paused() );
        assert!( h.controller.is_playing() );

        assert!( !h.controller.resume( Some( "bob" ) ) );
        assert!( h.controller.is_paused() );
        assert!( h.controller.resume( Some( "alice" ) ) );
        assert!( !h.controller.is_paused() );

        h.controller.pause( Some( "bob" ) );
        assert!( h.controller.resume( None ) );
        assert!( !h.controller.is_paused() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_rewind_restarts_from_zero() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 30, false ).await;
        drain( &mut h.events );

        h.controller.rewind().await;
        assert_eq!( h.resolver.calls()[ 1 ].1.seek_seconds, 0 );
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );

        let names = h.event_names();
        assert_eq!( &names[ ..2 ], &[ "rewind", "stop" ] );
        assert!( names.contains( &"playStarted" ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_disconnect_releases_everything() {
        let mut h = harness( &[ "a" ] );
        h.controller.play( 0, false ).await;
        drain( &mut h.events );

        h.controller.disconnect().await;
        settle().await;
        assert_eq!( h.connection.disconnect_count(), 1 );
        assert!( !h.controller.is_connected() );
        assert!( !h.controller.is_playing() );
        assert_eq!( h.controller.cost(), 0 );
        assert_eq!( h.controller.state(), PlaybackPhase::Idle );
        assert!( h.resolver.streams()[ 0 ].is_destroyed() );
        assert!( h.controller.current_source().is_none() );
        assert_eq!( h.controller.current_time(), Duration::ZERO );

        let names = h.event_names();
        assert!( names.starts_with( &[ "stop", "disconnectAttempt", "disconnect" ] ) );

        h.controller.disconnect().await;
        assert_eq!( h.connection.disconnect_count(), 1 );
        assert!( !h.event_names().contains( &"disconnect" ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_volume_uses_inline_transform() {
        let mut h = harness( &[ "a" ] );
        assert!( !h.controller.set_volume( 50 ) );
        h.controller.play( 0, false ).await;

        assert!( h.resolver.calls()[ 0 ].1.volume_transform_enabled );
        let volume = h.player.last_resource().unwrap().volume.unwrap();
        assert_eq!( volume.get(), 0.5 );

        assert!( h.controller.set_volume( 80 ) );
        assert_eq!( volume.get(), 0.8 );
        assert_eq!( h.controller.volume(), 80 );
        assert!( h.event_names().contains( &"volumeChanged" ) );

        h.controller.set_volume( 100 );
        h.controller.stop( false, true ).await;
        h.controller.play( 0, false ).await;
        assert!( !h.resolver.calls()[ 1 ].1.volume_transform_enabled );
        assert!( h.player.last_resource().unwrap().volume.is_none() );
    }


    #[tokio::test( start_paused = true )]
    async fn test_effect_args_reach_resolver() {
        let h = harness( &[ "a" ] );
        h.controller.set_effect_args( vec![ "-af".into(), "bass=g=5".into() ] );
        h.controller.play( 0, false ).await;
        assert_eq!( h.resolver.calls()[ 0 ].1.effect_args, vec![ "-af", "bass=g=5" ] );
    }


    #[tokio::test( start_paused = true )]
    async fn test_notification_failures_are_absorbed() {
        let h = harness( &[ "a" ] );
        h.notifier.set_failing( true );
        h.controller.play( 0, false ).await;
        assert_eq!( h.controller.state(), PlaybackPhase::Playing );
        assert_eq!( h.notifier.sent().len(), 2 );
    }


    /// Queue in radio mode that counts mix preparations.
    struct MixQueue {
        inner: PlayQueue,
        prepared: AtomicUsize,
    }


    #[async_trait]
    impl QueuePort for MixQueue {
        fn get( &self, index: usize ) -> Option<QueueItem> { self.inner.get( index ) }
        fn len( &self ) -> usize { self.inner.len() }
        fn length_seconds( &self ) -> u64 { self.inner.length_seconds() }
        async fn next( &self ) { self.inner.next().await }
        fn loop_enabled( &self ) -> bool { self.inner.loop_enabled() }
        fn set_loop_enabled( &self, enabled: bool ) { self.inner.set_loop_enabled( enabled ) }
        fn queue_loop_enabled( &self ) -> bool { self.inner.queue_loop_enabled() }
        fn set_queue_loop_enabled( &self, enabled: bool ) { self.inner.set_queue_loop_enabled( enabled ) }
        fn once_loop_enabled( &self ) -> bool { self.inner.once_loop_enabled() }
        fn set_once_loop_enabled( &self, enabled: bool ) { self.inner.set_once_loop_enabled( enabled ) }
        fn mix_playlist_enabled( &self ) -> bool { true }

        async fn prepare_next_mix_item( &self ) -> Result<(), PlaybackError> {
            self.prepared.fetch_add( 1, Ordering::SeqCst );
            Ok(())
        }
    }


    #[tokio::test( start_paused = true )]
    async fn test_mix_playlist_prepares_next_item() {
        let queue = Arc::new( MixQueue { inner: PlayQueue::new(), prepared: AtomicUsize::new( 0 ) } );
        queue.inner.add( QueueItem::new( MockSource::arc( "radio-1", 200 ), "radio" ) );
        let player = Arc::new( MockPlayer::new() );
        let controller = PlaybackController::new(
            "guild-2",
            PlaybackConfig::default(),
            queue.clone(),
            Arc::new( MockResolver::new() ),
            None,
        );
        controller.attach_connection( Arc::new( MockConnection::new( player ) ) );

        controller.play( 0, false ).await;
        assert_eq!( controller.state(), PlaybackPhase::Playing );
        assert_eq!( queue.prepared.load( Ordering::SeqCst ), 1 );
    }
}
