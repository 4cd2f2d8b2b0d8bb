//! Notifications rendered to stdout.

use async_trait::async_trait;

use cadenza_core::{ Notification, NotificationPort, NotifyError, NowPlaying };


/// Prints every notification as one or more lines on stdout.
pub struct ConsoleNotifier;


#[async_trait]
impl NotificationPort for ConsoleNotifier {
    async fn notify( &self, notification: Notification ) -> Result<(), NotifyError> {
        println!( "{}", render( &notification ) );
        Ok(())
    }
}


/// Formats seconds as `m:ss`, or `h:mm:ss` past the hour.
pub fn format_duration( secs: u64 ) -> String {
    let ( hours, minutes, seconds ) = ( secs / 3600, ( secs % 3600 ) / 60, secs % 60 );
    if hours > 0 {
        format!( "{}:{:02}:{:02}", hours, minutes, seconds )
    } else {
        format!( "{}:{:02}", minutes, seconds )
    }
}


fn length_label( length_seconds: u64, is_live: bool ) -> String {
    if is_live {
        "live".to_string()
    } else {
        format_duration( length_seconds )
    }
}


pub fn render( notification: &Notification ) -> String {
    match notification {
        Notification::WaitingForLive { title } => {
            format!( ":: Waiting for {} to go live", title )
        }
        Notification::WaitingCanceled => ":: Stopped waiting for the live stream".to_string(),
        Notification::Preparing { title, length_seconds, is_live } => {
            format!( ":: Preparing {} ({})", title, length_label( *length_seconds, *is_live ) )
        }
        Notification::NowPlaying( now ) => render_now_playing( now ),
        Notification::QueueEmpty => ":: Queue is empty".to_string(),
        Notification::QueueEmptyExiting => ":: Nothing left to play, leaving".to_string(),
        Notification::PlaybackFailed { skipping: true } => {
            "!! Playback failed too many times, skipping".to_string()
        }
        Notification::PlaybackFailed { skipping: false } => "!! Playback failed, retrying".to_string(),
    }
}


fn render_now_playing( now: &NowPlaying ) -> String {
    let mut out = format!(
        ">> Now playing: {} [{}] requested by {}",
        now.title,
        length_label( now.length_seconds, now.is_live ),
        now.requested_by
    );
    if let Some( url ) = &now.url {
        out.push_str( &format!( "\n   {}", url ) );
    }
    if let Some( next ) = &now.next_title {
        out.push_str( &format!( "\n   Next: {}", next ) );
    }
    if now.will_loop {
        out.push_str( "\n   Looping this track" );
    } else if now.remaining_count > 0 {
        out.push_str( &format!(
            "\n   {} more in queue ({})",
            now.remaining_count,
            format_duration( now.remaining_seconds )
        ));
    }
    if now.in_radio {
        out.push_str( "\n   Mix playlist" );
    }
    out
}


#[cfg( test )]
mod tests {
    use super::*;


    fn now_playing() -> NowPlaying {
        NowPlaying {
            title: "Roygbiv".into(),
            url: Some( "/music/roygbiv.flac".into() ),
            length_seconds: 151,
            is_live: false,
            requested_by: "console".into(),
            next_title: Some( "Olson".into() ),
            remaining_count: 2,
            remaining_seconds: 3725,
            will_loop: false,
            in_radio: false,
        }
    }


    #[test]
    fn test_format_duration() {
        assert_eq!( format_duration( 0 ), "0:00" );
        assert_eq!( format_duration( 151 ), "2:31" );
        assert_eq!( format_duration( 3725 ), "1:02:05" );
    }


    #[test]
    fn test_render_now_playing() {
        let text = render( &Notification::NowPlaying( now_playing() ) );
        assert_eq!(
            text,
            ">> Now playing: Roygbiv [2:31] requested by console\n   /music/roygbiv.flac\n   Next: Olson\n   2 more in queue (1:02:05)"
        );
    }


    #[test]
    fn test_looping_private_track_hides_count_and_url() {
        let mut now = now_playing();
        now.url = None;
        now.will_loop = true;
        let text = render( &Notification::NowPlaying( now ) );
        assert!( !text.contains( "/music" ) );
        assert!( text.contains( "Looping" ) );
        assert!( !text.contains( "more in queue" ) );
    }


    #[test]
    fn test_render_lifecycle_lines() {
        assert_eq!(
            render( &Notification::Preparing { title: "Stream".into(), length_seconds: 0, is_live: true } ),
            ":: Preparing Stream (live)"
        );
        assert!( render( &Notification::PlaybackFailed { skipping: true } ).contains( "skipping" ) );
        assert!( render( &Notification::PlaybackFailed { skipping: false } ).contains( "retrying" ) );
    }


    #[tokio::test]
    async fn test_console_never_fails() {
        assert!( ConsoleNotifier.notify( Notification::QueueEmpty ).await.is_ok() );
    }
}
