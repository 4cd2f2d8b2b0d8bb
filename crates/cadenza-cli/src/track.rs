//! Local files as playable sources.

use std::path::{ Path, PathBuf };

use async_trait::async_trait;

use cadenza_core::AudioSource;

use crate::media::{ MediaError, MediaFile };


/// A file on disk. Its url is the path.
#[derive( Debug, Clone )]
pub struct LocalTrack {
    path: PathBuf,
    url: String,
    title: String,
    length_seconds: u64,
}


impl LocalTrack {
    /// Probes `path` for its title and length.
    pub fn probe( path: &Path ) -> Result<Self, MediaError> {
        let file = MediaFile::open( path )?;
        let tags = file.tags();
        let fallback = path.file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_else( || path.display().to_string() );

        Ok( Self {
            path: path.to_path_buf(),
            url: path.display().to_string(),
            title: display_title( tags.artist.as_deref(), tags.title.as_deref(), &fallback ),
            length_seconds: file.duration().map_or( 0, |d| d.as_secs_f64().round() as u64 ),
        })
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }
}


fn display_title( artist: Option<&str>, title: Option<&str>, fallback: &str ) -> String {
    match ( artist, title ) {
        ( Some( artist ), Some( title ) ) => format!( "{} - {}", artist, title ),
        ( None, Some( title ) ) => title.to_string(),
        _ => fallback.to_string(),
    }
}


#[async_trait]
impl AudioSource for LocalTrack {
    fn url( &self ) -> &str {
        &self.url
    }

    fn title( &self ) -> &str {
        &self.title
    }

    fn length_seconds( &self ) -> u64 {
        self.length_seconds
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_display_title() {
        assert_eq!( display_title( Some( "Boards of Canada" ), Some( "Roygbiv" ), "04" ), "Boards of Canada - Roygbiv" );
        assert_eq!( display_title( None, Some( "Roygbiv" ), "04" ), "Roygbiv" );
        assert_eq!( display_title( Some( "Boards of Canada" ), None, "04" ), "04" );
    }


    #[test]
    fn test_unreadable_file_cannot_be_probed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "broken.flac" );
        std::fs::write( &path, b"fLaC but not really" ).unwrap();
        assert!( LocalTrack::probe( &path ).is_err() );
    }
}
