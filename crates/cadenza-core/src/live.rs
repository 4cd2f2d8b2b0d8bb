//! Waiting for scheduled live streams.

use std::time::{ Duration, SystemTime };

use tokio_util::sync::CancellationToken;

use crate::source::AudioSource;


/// How a live wait ended.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum LiveWaitOutcome {
    Live,
    Canceled,
}


/// Polls a not-yet-live source until it goes live or the wait is canceled.
#[derive( Debug, Clone )]
pub struct LiveWaitCoordinator {
    poll_interval: Duration,
}


impl LiveWaitCoordinator {
    pub fn new( poll_interval: Duration ) -> Self {
        Self { poll_interval }
    }


    /// Suspends until `source` reports live, `cancel` fires, or
    /// `superseded` says the wait no longer matters.
    ///
    /// A superseded wait cancels its own token so that anyone sharing it
    /// observes the cancellation too.
    pub async fn wait<F>(
        &self,
        source: &dyn AudioSource,
        cancel: &CancellationToken,
        mut superseded: F,
    ) -> LiveWaitOutcome
    where
        F: FnMut() -> bool,
    {
        loop {
            if cancel.is_cancelled() {
                return LiveWaitOutcome::Canceled;
            }
            if superseded() {
                tracing::info!( "Live wait superseded: {}", source.url() );
                cancel.cancel();
                return LiveWaitOutcome::Canceled;
            }

            match source.check_live().await {
                Ok( true ) => return LiveWaitOutcome::Live,
                Ok( false ) => {}
                Err( e ) => tracing::warn!( "Live check failed for {}: {}", source.url(), e ),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LiveWaitOutcome::Canceled,
                _ = tokio::time::sleep( self.next_delay( source ) ) => {}
            }
        }
    }


    /// Sleeps until the scheduled start if that comes sooner than the next poll.
    fn next_delay( &self, source: &dyn AudioSource ) -> Duration {
        source.available_after()
            .and_then( |at| at.duration_since( SystemTime::now() ).ok() )
            .filter( |until| !until.is_zero() )
            .map( |until| until.min( self.poll_interval ) )
            .unwrap_or( self.poll_interval )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{ AtomicBool, Ordering };

    use crate::testing::MockSource;


    fn coordinator() -> LiveWaitCoordinator {
        LiveWaitCoordinator::new( Duration::from_secs( 30 ) )
    }


    #[tokio::test( start_paused = true )]
    async fn test_already_live_returns_immediately() {
        let source = MockSource::new( "live", 0 );
        let outcome = coordinator().wait( &source, &CancellationToken::new(), || false ).await;
        assert_eq!( outcome, LiveWaitOutcome::Live );
    }


    #[tokio::test( start_paused = true )]
    async fn test_waits_until_source_goes_live() {
        let source = Arc::new( MockSource::new( "live", 0 ).scheduled() );
        let flip = source.clone();
        tokio::spawn( async move {
            tokio::time::sleep( Duration::from_secs( 95 ) ).await;
            flip.go_live();
        });

        let started = tokio::time::Instant::now();
        let outcome = coordinator().wait( source.as_ref(), &CancellationToken::new(), || false ).await;
        assert_eq!( outcome, LiveWaitOutcome::Live );
        // Detected on the first poll after going live
        assert_eq!( started.elapsed(), Duration::from_secs( 120 ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_cancel_aborts_wait() {
        let source = MockSource::new( "live", 0 ).scheduled();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn( async move {
            tokio::time::sleep( Duration::from_secs( 5 ) ).await;
            trigger.cancel();
        });

        let outcome = coordinator().wait( &source, &cancel, || false ).await;
        assert_eq!( outcome, LiveWaitOutcome::Canceled );
    }


    #[tokio::test( start_paused = true )]
    async fn test_superseded_wait_cancels_token() {
        let source = MockSource::new( "live", 0 ).scheduled();
        let cancel = CancellationToken::new();
        let replaced = Arc::new( AtomicBool::new( false ) );
        let flag = replaced.clone();
        tokio::spawn( async move {
            tokio::time::sleep( Duration::from_secs( 45 ) ).await;
            flag.store( true, Ordering::SeqCst );
        });

        let outcome = coordinator().wait( &source, &cancel, || replaced.load( Ordering::SeqCst ) ).await;
        assert_eq!( outcome, LiveWaitOutcome::Canceled );
        assert!( cancel.is_cancelled() );
    }
}
