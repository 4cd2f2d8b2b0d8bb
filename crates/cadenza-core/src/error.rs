//! Error taxonomy for the playback controller.
//!
//! Nothing in here is ever returned to callers of the controller's public
//! operations. Errors are classified and absorbed into a retry, a skip or a
//! disconnect; the only outward signal is the `HandledError` event.

use std::time::Duration;

use thiserror::Error;

use crate::engine::PlayerStatus;


/// Failures that can occur while preparing or playing a session.
#[derive( Debug, Clone, Error )]
pub enum PlaybackError {
    /// A known, recoverable upstream hiccup. Retried quietly.
    #[error( "Transient stream fault: {0}" )]
    Workaround( String ),

    #[error( "Failed to resolve stream: {0}" )]
    Resolve( String ),

    #[error( "Source error: {0}" )]
    Source( String ),

    #[error( "Audio player error: {0}" )]
    Player( String ),

    #[error( "Player did not enter {expected:?} within {timeout:?}" )]
    StateTimeout {
        expected: PlayerStatus,
        timeout: Duration,
    },

    #[error( "Something went wrong while playing stream" )]
    UnexpectedEnd,

    #[error( "Failed to prepare next mix item: {0}" )]
    MixPlaylist( String ),
}


impl PlaybackError {
    /// Returns true for benign faults that are retried without notifying anyone.
    pub fn is_workaround( &self ) -> bool {
        matches!( self, Self::Workaround( _ ) )
    }
}


/// Errors raised by a notification sink. Logged, never propagated.
#[derive( Debug, Error )]
pub enum NotifyError {
    #[error( "No bound text channel" )]
    Unbound,

    #[error( "Failed to deliver notification: {0}" )]
    Delivery( String ),
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_workaround_is_benign() {
        assert!( PlaybackError::Workaround( "403 on first chunk".into() ).is_workaround() );
        assert!( !PlaybackError::Resolve( "gone".into() ).is_workaround() );
        assert!( !PlaybackError::UnexpectedEnd.is_workaround() );
    }


    #[test]
    fn test_state_timeout_message() {
        let err = PlaybackError::StateTimeout {
            expected: PlayerStatus::Playing,
            timeout: Duration::from_secs( 10 ),
        };
        assert_eq!( err.to_string(), "Player did not enter Playing within 10s" );
    }
}
