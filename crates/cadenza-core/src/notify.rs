//! Notification port and the "now playing" view model.
//!
//! Rendering is the host's business. The controller only decides when a
//! notification is due and what it is about.

use async_trait::async_trait;

use crate::error::NotifyError;
use crate::queue::QueuePort;
use crate::source::QueueItem;


/// What the bound text surface should be told.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum Notification {
    WaitingForLive { title: String },
    WaitingCanceled,
    Preparing { title: String, length_seconds: u64, is_live: bool },
    NowPlaying( NowPlaying ),
    QueueEmpty,
    QueueEmptyExiting,
    /// `skipping` is true when this failure exhausts the retry budget
    PlaybackFailed { skipping: bool },
}


/// Receives notifications. Failures are logged by the caller, never propagated.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn notify( &self, notification: Notification ) -> Result<(), NotifyError>;
}


/// Everything needed to render a "now playing" card.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct NowPlaying {
    pub title: String,
    /// Withheld for private sources
    pub url: Option<String>,
    pub length_seconds: u64,
    pub is_live: bool,
    pub requested_by: String,
    /// Title of what plays next, if anything
    pub next_title: Option<String>,
    /// Items queued behind the current one
    pub remaining_count: usize,
    pub remaining_seconds: u64,
    /// Track loop is on, so the count is irrelevant
    pub will_loop: bool,
    pub in_radio: bool,
}


impl NowPlaying {
    /// Builds the view model for `current`, which is the queue head.
    pub fn build( current: &QueueItem, queue: &dyn QueuePort ) -> Self {
        let source = &current.source;
        let loop_enabled = queue.loop_enabled();
        let len = queue.len();

        let next_title = if loop_enabled {
            Some( source.title().to_string() )
        } else if len >= 2 {
            queue.get( 1 ).map( |item| item.title().to_string() )
        } else if queue.queue_loop_enabled() {
            Some( source.title().to_string() )
        } else {
            None
        };

        Self {
            title: source.title().to_string(),
            url: ( !source.is_private() ).then( || source.url().to_string() ),
            length_seconds: source.length_seconds(),
            is_live: source.is_live_stream(),
            requested_by: current.added_by.clone(),
            next_title,
            remaining_count: len.saturating_sub( 1 ),
            remaining_seconds: queue.length_seconds().saturating_sub( source.length_seconds() ),
            will_loop: loop_enabled,
            in_radio: queue.mix_playlist_enabled(),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::queue::PlayQueue;
    use crate::testing::MockSource;


    fn queue_of( titles: &[&str] ) -> PlayQueue {
        let queue = PlayQueue::new();
        for title in titles {
            queue.add( QueueItem::new( MockSource::arc( title, 100 ), "alice" ) );
        }
        queue
    }


    #[test]
    fn test_next_is_second_item() {
        let queue = queue_of( &[ "a", "b", "c" ] );
        let np = NowPlaying::build( &queue.get( 0 ).unwrap(), &queue );
        assert_eq!( np.next_title.as_deref(), Some( "b" ) );
        assert_eq!( np.remaining_count, 2 );
        assert_eq!( np.remaining_seconds, 200 );
        assert_eq!( np.requested_by, "alice" );
        assert!( !np.will_loop );
    }


    #[test]
    fn test_track_loop_points_at_current() {
        let queue = queue_of( &[ "a", "b" ] );
        queue.set_loop_enabled( true );
        let np = NowPlaying::build( &queue.get( 0 ).unwrap(), &queue );
        assert_eq!( np.next_title.as_deref(), Some( "a" ) );
        assert!( np.will_loop );
    }


    #[test]
    fn test_single_item_depends_on_queue_loop() {
        let queue = queue_of( &[ "a" ] );
        let np = NowPlaying::build( &queue.get( 0 ).unwrap(), &queue );
        assert_eq!( np.next_title, None );

        queue.set_queue_loop_enabled( true );
        let np = NowPlaying::build( &queue.get( 0 ).unwrap(), &queue );
        assert_eq!( np.next_title.as_deref(), Some( "a" ) );
    }


    #[test]
    fn test_private_source_hides_url() {
        let queue = PlayQueue::new();
        queue.add( QueueItem::new( std::sync::Arc::new( MockSource::new( "secret", 10 ).private() ), "bob" ) );
        let np = NowPlaying::build( &queue.get( 0 ).unwrap(), &queue );
        assert_eq!( np.url, None );
    }
}
