//! Controller tuning knobs.

use std::time::Duration;

use serde::{ Deserialize, Serialize };


/// Timeouts and limits for one guild's playback controller.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
#[serde( default )]
pub struct PlaybackConfig {
    /// Genuine failures of the same source tolerated before it is skipped
    pub retry_limit: u32,

    /// How long to linger in a voice channel with an empty queue
    pub idle_timeout_secs: u64,

    /// Bound on waiting for the player to start after handing it a resource
    pub start_timeout_secs: u64,

    /// Bound on waiting for the player to go idle during a waited stop
    pub stop_timeout_secs: u64,

    /// Bound on waiting for the player to go idle after the stream ended
    pub finish_timeout_secs: u64,

    /// How often a scheduled live stream is re-checked
    pub live_poll_interval_secs: u64,

    /// Event bus buffer size
    pub event_capacity: usize,
}


impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            idle_timeout_secs: 10 * 60,
            start_timeout_secs: 10,
            stop_timeout_secs: 10,
            finish_timeout_secs: 20,
            live_poll_interval_secs: 30,
            event_capacity: 64,
        }
    }
}


impl PlaybackConfig {
    pub fn idle_timeout( &self ) -> Duration {
        Duration::from_secs( self.idle_timeout_secs )
    }


    pub fn start_timeout( &self ) -> Duration {
        Duration::from_secs( self.start_timeout_secs )
    }


    pub fn stop_timeout( &self ) -> Duration {
        Duration::from_secs( self.stop_timeout_secs )
    }


    pub fn finish_timeout( &self ) -> Duration {
        Duration::from_secs( self.finish_timeout_secs )
    }


    pub fn live_poll_interval( &self ) -> Duration {
        // Zero would spin the live wait loop
        Duration::from_secs( self.live_poll_interval_secs.max( 1 ) )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_defaults() {
        let config = PlaybackConfig::default();
        assert_eq!( config.retry_limit, 3 );
        assert_eq!( config.idle_timeout(), Duration::from_secs( 600 ) );
        assert_eq!( config.start_timeout(), Duration::from_secs( 10 ) );
        assert_eq!( config.finish_timeout(), Duration::from_secs( 20 ) );
    }


    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PlaybackConfig = serde_json::from_str( r#"{ "retry_limit": 5 }"# ).unwrap();
        assert_eq!( config.retry_limit, 5 );
        assert_eq!( config.stop_timeout_secs, 10 );
        assert_eq!( config.event_capacity, 64 );
    }


    #[test]
    fn test_live_poll_interval_never_zero() {
        let config = PlaybackConfig { live_poll_interval_secs: 0, ..Default::default() };
        assert_eq!( config.live_poll_interval(), Duration::from_secs( 1 ) );
    }
}
