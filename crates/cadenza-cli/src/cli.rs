//! Command-line argument parsing for Cadenza.

use std::path::PathBuf;

use clap::Parser;


/// Cadenza - plays local files through a guild playback controller.
#[derive( Parser, Debug )]
#[command( name = "cadenza" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Replay the current track forever.
    #[arg( long = "loop", conflicts_with = "queue_loop" )]
    pub track_loop: bool,

    /// Rotate finished tracks to the back of the queue.
    #[arg( long )]
    pub queue_loop: bool,

    /// Volume in percent.
    #[arg( short, long, value_parser = clap::value_parser!( u8 ).range( 0..=200 ) )]
    pub volume: Option<u8>,

    /// Start the first track this many seconds in.
    #[arg( short, long, default_value_t = 0 )]
    pub seek: u64,

    /// Seconds to linger after the queue runs dry.
    #[arg( long )]
    pub idle_timeout: Option<u64>,

    /// Playback speed multiplier for the simulated voice connection.
    #[arg( long, default_value_t = 1.0 )]
    pub speed: f64,

    /// Simulated voice channel bitrate in bits per second.
    #[arg( long )]
    pub bitrate: Option<u32>,

    /// Audio filter argument handed to the resolver. Repeatable.
    #[arg( long = "effect" )]
    pub effects: Vec<String>,

    /// Guild id used in logs.
    #[arg( long, default_value = "local" )]
    pub guild: String,

    /// Write the effective settings back to the settings file.
    #[arg( long )]
    pub save_settings: bool,

    /// Files or directories to queue, in order.
    #[arg( required = true, trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from( [ "cadenza", "song.flac" ] ).unwrap();
        assert!( !args.track_loop );
        assert!( !args.queue_loop );
        assert_eq!( args.volume, None );
        assert_eq!( args.seek, 0 );
        assert_eq!( args.speed, 1.0 );
        assert_eq!( args.guild, "local" );
        assert_eq!( args.files, vec![ PathBuf::from( "song.flac" ) ] );
    }


    #[test]
    fn test_full_invocation() {
        let args = Args::try_parse_from( [
            "cadenza", "--queue-loop", "-v", "50", "-s", "30", "--idle-timeout", "5",
            "--effect", "bass=g=5", "--effect", "atempo=1.25", "a.mp3", "music/",
        ]).unwrap();
        assert!( args.queue_loop );
        assert_eq!( args.volume, Some( 50 ) );
        assert_eq!( args.seek, 30 );
        assert_eq!( args.idle_timeout, Some( 5 ) );
        assert_eq!( args.effects, vec![ "bass=g=5", "atempo=1.25" ] );
        assert_eq!( args.files.len(), 2 );
    }


    #[test]
    fn test_rejects_conflicting_loops() {
        assert!( Args::try_parse_from( [ "cadenza", "--loop", "--queue-loop", "a.mp3" ] ).is_err() );
    }


    #[test]
    fn test_requires_files() {
        assert!( Args::try_parse_from( [ "cadenza" ] ).is_err() );
    }


    #[test]
    fn test_rejects_out_of_range_volume() {
        assert!( Args::try_parse_from( [ "cadenza", "-v", "201", "a.mp3" ] ).is_err() );
    }
}
