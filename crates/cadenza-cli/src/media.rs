//! Local media access via Symphonia
//!
//! Probes files for tags, duration and codec, and demuxes packets for the
//! paced stream producer. Nothing here decodes audio.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::codecs::{ CodecType, CODEC_TYPE_NULL, CODEC_TYPE_OPUS, CODEC_TYPE_PCM_S16LE };
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::{ MetadataOptions, StandardTagKey, Tag };
use symphonia::core::probe::Hint;
use symphonia::core::units::{ Time, TimeBase };
use thiserror::Error;

use cadenza_core::{ ContainerType, PlaybackError };


/// Errors that can occur while reading local media.
#[derive( Debug, Error )]
pub enum MediaError {
    #[error( "Failed to open file: {0}" )]
    FileOpen( #[from] std::io::Error ),

    #[error( "Unsupported format" )]
    UnsupportedFormat,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Seek error: {0}" )]
    Seek( String ),

    #[error( "Read error: {0}" )]
    Read( String ),
}


impl From<MediaError> for PlaybackError {
    fn from( e: MediaError ) -> Self {
        PlaybackError::Resolve( e.to_string() )
    }
}


/// Tags worth showing in notifications.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct Tags {
    pub title: Option<String>,
    pub artist: Option<String>,
}


/// An opened audio file positioned at its first packet.
pub struct MediaFile {
    reader: Box<dyn FormatReader>,
    track_id: u32,
    codec: CodecType,
    sample_rate: u32,
    channels: usize,
    time_base: Option<TimeBase>,
    duration: Option<Duration>,
    extension: Option<String>,
    tags: Tags,
}


impl MediaFile {
    /// Opens and probes an audio file.
    pub fn open( path: &Path ) -> Result<Self, MediaError> {
        let file = File::open( path )?;
        let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions::default() );

        let extension = path.extension()
            .and_then( |e| e.to_str() )
            .map( str::to_ascii_lowercase );
        let mut hint = Hint::new();
        if let Some( ext ) = &extension {
            hint.with_extension( ext );
        }

        let mut probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| MediaError::UnsupportedFormat )?;

        let mut tags = Tags::default();
        if let Some( revision ) = probed.metadata.get().as_ref().and_then( |log| log.current() ) {
            collect_tags( &mut tags, revision.tags() );
        }
        if let Some( revision ) = probed.format.metadata().current() {
            collect_tags( &mut tags, revision.tags() );
        }

        let reader = probed.format;
        let track = reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( MediaError::NoAudioTrack )?;

        let params = &track.codec_params;
        let sample_rate = params.sample_rate.unwrap_or( 44100 );
        let channels = params.channels.map( |c| c.count() ).unwrap_or( 2 );
        let duration = params.n_frames.map( |frames| {
            Duration::from_secs_f64( frames as f64 / sample_rate as f64 )
        });

        tracing::debug!(
            "Opened {:?}: {} Hz, {} channels, duration: {:?}",
            path,
            sample_rate,
            channels,
            duration
        );

        Ok( Self {
            track_id: track.id,
            codec: params.codec,
            sample_rate,
            channels,
            time_base: params.time_base,
            duration,
            extension,
            tags,
            reader,
        })
    }


    pub fn duration( &self ) -> Option<Duration> {
        self.duration
    }


    pub fn tags( &self ) -> &Tags {
        &self.tags
    }


    /// Framing the voice transport could take without transcoding.
    pub fn container( &self ) -> ContainerType {
        container_for( self.codec, self.extension.as_deref(), self.sample_rate, self.channels )
    }


    /// Seeks to a position in seconds.
    pub fn seek( &mut self, position_secs: f64 ) -> Result<(), MediaError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position_secs ),
            track_id: Some( self.track_id ),
        };
        self.reader
            .seek( SeekMode::Coarse, seek_to )
            .map_err( |e| MediaError::Seek( e.to_string() ) )?;
        Ok(())
    }


    /// Reads the next packet of the audio track and returns how much audio
    /// it carries. Returns None at end of stream.
    pub fn next_packet_duration( &mut self ) -> Result<Option<Duration>, MediaError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok( packet ) => packet,
                Err( symphonia::core::errors::Error::IoError( ref e ) )
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok( None );
                }
                Err( e ) => return Err( MediaError::Read( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let duration = match self.time_base {
                Some( tb ) => {
                    let time = tb.calc_time( packet.dur );
                    Duration::from_secs( time.seconds ) + Duration::from_secs_f64( time.frac )
                }
                None => Duration::from_secs_f64( packet.dur as f64 / self.sample_rate as f64 ),
            };
            return Ok( Some( duration ) );
        }
    }
}


fn collect_tags( tags: &mut Tags, found: &[Tag] ) {
    for tag in found {
        match tag.std_key {
            Some( StandardTagKey::TrackTitle ) if tags.title.is_none() => {
                tags.title = Some( tag.value.to_string() );
            }
            Some( StandardTagKey::Artist ) if tags.artist.is_none() => {
                tags.artist = Some( tag.value.to_string() );
            }
            _ => {}
        }
    }
}


/// Opus in a known container passes through; so does 48 kHz stereo s16le.
/// Everything else has to be transcoded.
fn container_for( codec: CodecType, extension: Option<&str>, sample_rate: u32, channels: usize ) -> ContainerType {
    if codec == CODEC_TYPE_OPUS {
        return match extension {
            Some( "webm" | "mkv" ) => ContainerType::WebmOpus,
            Some( "ogg" | "opus" ) => ContainerType::OggOpus,
            _ => ContainerType::Opus,
        };
    }
    if codec == CODEC_TYPE_PCM_S16LE && sample_rate == 48_000 && channels == 2 {
        return ContainerType::Raw;
    }
    ContainerType::Arbitrary
}


#[cfg( test )]
mod tests {
    use super::*;
    use symphonia::core::codecs::{ CODEC_TYPE_FLAC, CODEC_TYPE_MP3 };


    #[test]
    fn test_opus_container_follows_extension() {
        assert_eq!( container_for( CODEC_TYPE_OPUS, Some( "webm" ), 48_000, 2 ), ContainerType::WebmOpus );
        assert_eq!( container_for( CODEC_TYPE_OPUS, Some( "opus" ), 48_000, 2 ), ContainerType::OggOpus );
        assert_eq!( container_for( CODEC_TYPE_OPUS, None, 48_000, 2 ), ContainerType::Opus );
    }


    #[test]
    fn test_only_voice_ready_pcm_is_raw() {
        assert_eq!( container_for( CODEC_TYPE_PCM_S16LE, Some( "wav" ), 48_000, 2 ), ContainerType::Raw );
        assert_eq!( container_for( CODEC_TYPE_PCM_S16LE, Some( "wav" ), 44_100, 2 ), ContainerType::Arbitrary );
        assert_eq!( container_for( CODEC_TYPE_MP3, Some( "mp3" ), 48_000, 2 ), ContainerType::Arbitrary );
        assert_eq!( container_for( CODEC_TYPE_FLAC, Some( "flac" ), 48_000, 2 ), ContainerType::Arbitrary );
    }


    #[test]
    fn test_missing_file() {
        let err = MediaFile::open( Path::new( "/nonexistent/cadenza.flac" ) ).err().unwrap();
        assert!( matches!( err, MediaError::FileOpen( _ ) ) );
        let playback: PlaybackError = err.into();
        assert!( matches!( playback, PlaybackError::Resolve( _ ) ) );
    }


    #[test]
    fn test_garbage_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "noise.mp3" );
        std::fs::write( &path, b"definitely not audio" ).unwrap();
        assert!( matches!( MediaFile::open( &path ), Err( MediaError::UnsupportedFormat ) ) );
    }
}
