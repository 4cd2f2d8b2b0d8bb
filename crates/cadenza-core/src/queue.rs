//! Queue port and the default in-memory queue.
//!
//! The controller only ever looks at the head of the queue, advances it,
//! and reads or clears the loop flags. `PlayQueue` is a straightforward
//! implementation for hosts that have no queue of their own.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PlaybackError;
use crate::source::QueueItem;


/// Ordered collection of playable items with loop flags.
#[async_trait]
pub trait QueuePort: Send + Sync {
    fn get( &self, index: usize ) -> Option<QueueItem>;

    fn len( &self ) -> usize;

    fn is_empty( &self ) -> bool {
        self.len() == 0
    }

    /// Sum of the known lengths of every item, in seconds.
    fn length_seconds( &self ) -> u64;

    /// Advances the head of the queue.
    async fn next( &self );

    fn loop_enabled( &self ) -> bool;

    fn set_loop_enabled( &self, enabled: bool );

    fn queue_loop_enabled( &self ) -> bool;

    fn set_queue_loop_enabled( &self, enabled: bool );

    fn once_loop_enabled( &self ) -> bool;

    fn set_once_loop_enabled( &self, enabled: bool );

    /// True when the queue is fed by an auto-generated mix ("radio").
    fn mix_playlist_enabled( &self ) -> bool {
        false
    }

    /// Fetches the next mix item ahead of time.
    async fn prepare_next_mix_item( &self ) -> Result<(), PlaybackError> {
        Ok(())
    }
}


#[derive( Debug, Default )]
struct QueueState {
    items: Vec<QueueItem>,
    loop_enabled: bool,
    queue_loop_enabled: bool,
    once_loop_enabled: bool,
}


/// In-memory queue.
#[derive( Debug, Default )]
pub struct PlayQueue {
    state: Mutex<QueueState>,
}


impl PlayQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }


    /// Adds an item to the end of the queue.
    pub fn add( &self, item: QueueItem ) {
        self.state.lock().items.push( item );
    }


    /// Adds multiple items to the end of the queue.
    pub fn add_many( &self, items: impl IntoIterator<Item = QueueItem> ) {
        self.state.lock().items.extend( items );
    }


    /// Removes every item. Loop flags are kept.
    pub fn clear( &self ) {
        self.state.lock().items.clear();
    }


    /// Removes the item at the specified index.
    pub fn remove( &self, index: usize ) -> Option<QueueItem> {
        let mut state = self.state.lock();
        if index >= state.items.len() {
            return None;
        }
        Some( state.items.remove( index ) )
    }


    /// Moves an item from one position to another.
    ///
    /// Returns true if the move was successful.
    pub fn move_item( &self, from: usize, to: usize ) -> bool {
        let mut state = self.state.lock();
        if from >= state.items.len() || to >= state.items.len() {
            return false;
        }

        if from != to {
            let item = state.items.remove( from );
            state.items.insert( to, item );
        }
        true
    }


    /// Removes items whose url was already queued, keeping the first occurrence.
    ///
    /// Returns the number of duplicates removed.
    pub fn dedup( &self ) -> usize {
        let mut state = self.state.lock();
        let original_len = state.items.len();
        let mut seen = HashSet::new();
        state.items.retain( |item| seen.insert( item.source.url().to_string() ) );
        original_len - state.items.len()
    }


    /// Snapshot of the queued items, head first.
    pub fn items( &self ) -> Vec<QueueItem> {
        self.state.lock().items.clone()
    }
}


#[async_trait]
impl QueuePort for PlayQueue {
    fn get( &self, index: usize ) -> Option<QueueItem> {
        self.state.lock().items.get( index ).cloned()
    }


    fn len( &self ) -> usize {
        self.state.lock().items.len()
    }


    fn length_seconds( &self ) -> u64 {
        self.state.lock().items.iter()
            .map( |item| item.source.length_seconds() )
            .sum()
    }


    async fn next( &self ) {
        let mut state = self.state.lock();
        if state.items.is_empty() {
            return;
        }

        let head = state.items.remove( 0 );
        if state.queue_loop_enabled {
            state.items.push( head );
        }
    }


    fn loop_enabled( &self ) -> bool {
        self.state.lock().loop_enabled
    }


    fn set_loop_enabled( &self, enabled: bool ) {
        self.state.lock().loop_enabled = enabled;
    }


    fn queue_loop_enabled( &self ) -> bool {
        self.state.lock().queue_loop_enabled
    }


    fn set_queue_loop_enabled( &self, enabled: bool ) {
        self.state.lock().queue_loop_enabled = enabled;
    }


    fn once_loop_enabled( &self ) -> bool {
        self.state.lock().once_loop_enabled
    }


    fn set_once_loop_enabled( &self, enabled: bool ) {
        self.state.lock().once_loop_enabled = enabled;
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::MockSource;


    fn queue_of( urls: &[&str] ) -> PlayQueue {
        let queue = PlayQueue::new();
        queue.add_many( urls.iter().map( |url| QueueItem::new( MockSource::arc( url, 180 ), "tester" ) ) );
        queue
    }


    fn urls( queue: &PlayQueue ) -> Vec<String> {
        queue.items().iter().map( |item| item.source.url().to_string() ).collect()
    }


    #[tokio::test]
    async fn test_next_drops_head() {
        let queue = queue_of( &[ "a", "b" ] );
        queue.next().await;
        assert_eq!( urls( &queue ), vec![ "b" ] );
        queue.next().await;
        assert!( queue.is_empty() );
        // Advancing an empty queue is a no-op
        queue.next().await;
        assert!( queue.is_empty() );
    }


    #[tokio::test]
    async fn test_next_with_queue_loop_rotates() {
        let queue = queue_of( &[ "a", "b", "c" ] );
        queue.set_queue_loop_enabled( true );
        queue.next().await;
        assert_eq!( urls( &queue ), vec![ "b", "c", "a" ] );
    }


    #[test]
    fn test_move_item() {
        let queue = queue_of( &[ "a", "b", "c" ] );
        assert!( queue.move_item( 0, 2 ) );
        assert_eq!( urls( &queue ), vec![ "b", "c", "a" ] );
        assert!( !queue.move_item( 0, 3 ) );
    }


    #[test]
    fn test_dedup_keeps_first() {
        let queue = queue_of( &[ "a", "b", "a", "c", "b" ] );
        assert_eq!( queue.dedup(), 2 );
        assert_eq!( urls( &queue ), vec![ "a", "b", "c" ] );
    }


    #[test]
    fn test_remove_and_length() {
        let queue = queue_of( &[ "a", "b" ] );
        assert_eq!( queue.length_seconds(), 360 );
        assert!( queue.remove( 5 ).is_none() );
        assert_eq!( queue.remove( 0 ).map( |item| item.source.url().to_string() ), Some( "a".into() ) );
        assert_eq!( queue.length_seconds(), 180 );
    }
}
