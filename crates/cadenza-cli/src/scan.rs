//! Expands command-line paths into audio files.

use std::path::{ Path, PathBuf };

use thiserror::Error;


/// Supported audio file extensions.
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav", "m4a", "aac", "opus", "webm", "mkv", "aiff",
];


/// Errors that can occur while scanning.
#[derive( Debug, Error )]
pub enum ScanError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Path not found: {0}" )]
    NotFound( PathBuf ),
}


/// Returns every audio file under `paths`, keeping the argument order.
///
/// Files are taken as given; directories are walked recursively and their
/// contents sorted by path.
pub fn collect( paths: &[PathBuf] ) -> Result<Vec<PathBuf>, ScanError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            tracing::info!( "Scanning: {:?}", path );
            let mut found = Vec::new();
            scan_recursive( path, &mut found )?;
            found.sort();
            files.extend( found );
        } else if path.exists() {
            files.push( path.clone() );
        } else {
            return Err( ScanError::NotFound( path.clone() ) );
        }
    }

    tracing::info!( "Found {} tracks", files.len() );
    Ok( files )
}


fn scan_recursive( dir: &Path, files: &mut Vec<PathBuf> ) -> Result<(), ScanError> {
    let entries = match std::fs::read_dir( dir ) {
        Ok( e ) => e,
        Err( e ) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            tracing::warn!( "Access denied: {:?}", dir );
            return Ok(());
        }
        Err( e ) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err( ScanError::NotFound( dir.to_path_buf() ) );
        }
        Err( e ) => return Err( ScanError::Io( e ) ),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_recursive( &path, files )?;
        } else if is_audio_file( &path ) {
            files.push( path );
        }
    }

    Ok(())
}


fn is_audio_file( path: &Path ) -> bool {
    path.extension()
        .and_then( |e| e.to_str() )
        .map( |e| SUPPORTED_EXTENSIONS.contains( &e.to_lowercase().as_str() ) )
        .unwrap_or( false )
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;


    #[test]
    fn test_is_audio_file() {
        assert!( is_audio_file( Path::new( "a/b/song.FLAC" ) ) );
        assert!( is_audio_file( Path::new( "stream.opus" ) ) );
        assert!( !is_audio_file( Path::new( "cover.jpg" ) ) );
        assert!( !is_audio_file( Path::new( "README" ) ) );
    }


    #[test]
    fn test_walks_directories_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir( root.join( "disc2" ) ).unwrap();
        fs::create_dir( root.join( "disc1" ) ).unwrap();
        fs::write( root.join( "disc2" ).join( "01.mp3" ), b"" ).unwrap();
        fs::write( root.join( "disc1" ).join( "02.flac" ), b"" ).unwrap();
        fs::write( root.join( "disc1" ).join( "01.flac" ), b"" ).unwrap();
        fs::write( root.join( "disc1" ).join( "folder.jpg" ), b"" ).unwrap();

        let files = collect( &[ root.to_path_buf() ] ).unwrap();
        let names: Vec<_> = files.iter()
            .map( |p| p.strip_prefix( root ).unwrap().to_string_lossy().replace( '\\', "/" ) )
            .collect();
        assert_eq!( names, vec![ "disc1/01.flac", "disc1/02.flac", "disc2/01.mp3" ] );
    }


    #[test]
    fn test_explicit_files_keep_argument_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = dir.path().join( "b.mp3" );
        let a = dir.path().join( "a.mp3" );
        fs::write( &a, b"" ).unwrap();
        fs::write( &b, b"" ).unwrap();

        assert_eq!( collect( &[ b.clone(), a.clone() ] ).unwrap(), vec![ b, a ] );
    }


    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join( "nope.mp3" );
        assert!( matches!( collect( &[ missing ] ), Err( ScanError::NotFound( _ ) ) ) );
    }
}
