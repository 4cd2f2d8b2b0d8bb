//! Source descriptors for playable items.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::PlaybackError;


/// Metadata and readiness of one playable track.
///
/// Identity for retry bookkeeping is the `url`; identity for live-wait
/// supersession is the `Arc` itself.
#[async_trait]
pub trait AudioSource: Send + Sync + fmt::Debug {
    fn url( &self ) -> &str;

    fn title( &self ) -> &str;

    /// Known length in seconds. Zero when unknown or live.
    fn length_seconds( &self ) -> u64;

    fn is_live_stream( &self ) -> bool {
        false
    }

    /// Private sources are never linked in notifications.
    fn is_private( &self ) -> bool {
        false
    }

    /// Scheduled start of a live stream that has not begun yet.
    fn available_after( &self ) -> Option<SystemTime> {
        None
    }

    /// Returns true while the source cannot be played yet.
    fn awaiting_live( &self ) -> bool {
        self.available_after()
            .map( |at| at > SystemTime::now() )
            .unwrap_or( false )
    }

    /// Asks upstream whether the stream has gone live.
    async fn check_live( &self ) -> Result<bool, PlaybackError> {
        Ok( !self.awaiting_live() )
    }

    /// Drops any cached resolution data so the next attempt starts fresh.
    fn purge_cache( &self ) {}
}


/// An entry in a guild's queue.
#[derive( Debug, Clone )]
pub struct QueueItem {
    pub source: Arc<dyn AudioSource>,
    /// Display name of the member who queued it
    pub added_by: String,
}


impl QueueItem {
    pub fn new( source: Arc<dyn AudioSource>, added_by: impl Into<String> ) -> Self {
        Self {
            source,
            added_by: added_by.into(),
        }
    }


    pub fn title( &self ) -> &str {
        self.source.title()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;


    #[derive( Debug )]
    struct Premiere {
        starts: SystemTime,
    }

    impl AudioSource for Premiere {
        fn url( &self ) -> &str {
            "https://example.com/premiere"
        }

        fn title( &self ) -> &str {
            "Premiere"
        }

        fn length_seconds( &self ) -> u64 {
            0
        }

        fn is_live_stream( &self ) -> bool {
            true
        }

        fn available_after( &self ) -> Option<SystemTime> {
            Some( self.starts )
        }
    }


    #[tokio::test]
    async fn test_future_premiere_is_awaiting_live() {
        let source = Premiere { starts: SystemTime::now() + Duration::from_secs( 3600 ) };
        assert!( source.awaiting_live() );
        assert!( !source.check_live().await.unwrap() );
    }


    #[tokio::test]
    async fn test_started_premiere_is_playable() {
        let source = Premiere { starts: SystemTime::now() - Duration::from_secs( 60 ) };
        assert!( !source.awaiting_live() );
        assert!( source.check_live().await.unwrap() );
    }


    #[test]
    fn test_queue_item_title_comes_from_source() {
        let item = QueueItem::new( Arc::new( Premiere { starts: SystemTime::now() } ), "alice" );
        assert_eq!( item.title(), "Premiere" );
        assert_eq!( item.added_by, "alice" );
    }
}
