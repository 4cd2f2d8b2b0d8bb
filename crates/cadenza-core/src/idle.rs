//! One-shot idle timer.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;


/// Runs a callback after `timeout` unless disarmed first.
///
/// Dropping the timer disarms it.
#[derive( Debug )]
pub(crate) struct IdleTimer {
    cancel: CancellationToken,
}


impl IdleTimer {
    /// Arms the timer. `on_expire` receives the timer's token so it can
    /// confirm, under its own lock, that it was not disarmed in the meantime.
    pub(crate) fn arm<F, Fut>( timeout: Duration, on_expire: F ) -> Self
    where
        F: FnOnce( CancellationToken ) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn( async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep( timeout ) => on_expire( token.clone() ).await,
            }
        });
        Self { cancel }
    }


    pub(crate) fn is_armed( &self ) -> bool {
        !self.cancel.is_cancelled()
    }
}


impl Drop for IdleTimer {
    fn drop( &mut self ) {
        self.cancel.cancel();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{ AtomicBool, Ordering };


    fn flagging_timer( fired: &Arc<AtomicBool> ) -> IdleTimer {
        let fired = fired.clone();
        IdleTimer::arm( Duration::from_secs( 600 ), move |token| async move {
            if !token.is_cancelled() {
                fired.store( true, Ordering::SeqCst );
            }
        })
    }


    #[tokio::test( start_paused = true )]
    async fn test_fires_after_timeout() {
        let fired = Arc::new( AtomicBool::new( false ) );
        let timer = flagging_timer( &fired );
        assert!( timer.is_armed() );

        tokio::time::sleep( Duration::from_secs( 599 ) ).await;
        assert!( !fired.load( Ordering::SeqCst ) );
        tokio::time::sleep( Duration::from_secs( 2 ) ).await;
        assert!( fired.load( Ordering::SeqCst ) );
    }


    #[tokio::test( start_paused = true )]
    async fn test_drop_disarms() {
        let fired = Arc::new( AtomicBool::new( false ) );
        let timer = flagging_timer( &fired );
        tokio::time::sleep( Duration::from_secs( 300 ) ).await;
        drop( timer );

        tokio::time::sleep( Duration::from_secs( 900 ) ).await;
        assert!( !fired.load( Ordering::SeqCst ) );
    }
}
