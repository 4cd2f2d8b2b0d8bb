//! Persistent settings
//!
//! Controller tuning and harness defaults, stored as JSON under the
//! platform config directory. Command-line flags override stored values.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };

use cadenza_core::PlaybackConfig;

use crate::cli::Args;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Controller timeouts and limits
    pub playback: PlaybackConfig,

    /// Volume in percent
    pub volume: u8,

    /// Bitrate of the simulated voice channel
    pub bitrate: u32,

    /// Audio filter arguments passed to the resolver
    pub effect_args: Vec<String>,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            playback: PlaybackConfig::default(),
            volume: 100,
            bitrate: 96_000,
            effect_args: Vec::new(),
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "cadenza" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( path ) {
            Ok( contents ) => serde_json::from_str( &contents ).unwrap_or_else( |e| {
                tracing::warn!( "Ignoring malformed settings {:?}: {}", path, e );
                Self::default()
            }),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        if let Some( path ) = Self::settings_path() {
            self.save_to( &path );
        }
    }


    fn save_to( &self, path: &Path ) {
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    /// Overrides stored values with the ones given on the command line.
    pub fn apply( &mut self, args: &Args ) {
        if let Some( volume ) = args.volume {
            self.volume = volume;
        }
        if let Some( secs ) = args.idle_timeout {
            self.playback.idle_timeout_secs = secs;
        }
        if let Some( bitrate ) = args.bitrate {
            self.bitrate = bitrate;
        }
        if !args.effects.is_empty() {
            self.effect_args = args.effects.clone();
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use clap::Parser;


    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!( Settings::load_from( &dir.path().join( "settings.json" ) ), Settings::default() );
    }


    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "nested" ).join( "settings.json" );

        let mut settings = Settings::default();
        settings.volume = 40;
        settings.playback.retry_limit = 5;
        settings.save_to( &path );

        assert_eq!( Settings::load_from( &path ), settings );
    }


    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, r#"{ "volume": 70, "playback": { "idle_timeout_secs": 30 } }"# ).unwrap();

        let settings = Settings::load_from( &path );
        assert_eq!( settings.volume, 70 );
        assert_eq!( settings.bitrate, 96_000 );
        assert_eq!( settings.playback.idle_timeout_secs, 30 );
        assert_eq!( settings.playback.retry_limit, 3 );
    }


    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, "{ volume" ).unwrap();
        assert_eq!( Settings::load_from( &path ), Settings::default() );
    }


    #[test]
    fn test_flags_override_file() {
        let mut settings = Settings::default();
        settings.effect_args = vec![ "bass=g=5".into() ];

        let args = Args::try_parse_from( [ "cadenza", "-v", "25", "--idle-timeout", "0", "a.mp3" ] ).unwrap();
        settings.apply( &args );

        assert_eq!( settings.volume, 25 );
        assert_eq!( settings.playback.idle_timeout_secs, 0 );
        assert_eq!( settings.bitrate, 96_000 );
        assert_eq!( settings.effect_args, vec![ "bass=g=5" ] );
    }
}
