//! Stream resolution for local files
//!
//! Opens the file named by the source url, seeks, and starts a producer
//! task that demuxes packets at playback pace. The stream ends when the
//! producer reaches end of file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use cadenza_core::{
    AudioSource, AudioStream, ContainerType, PlaybackError, ResolveOptions, ResolvedStream, SignalStream, StreamResolver,
};

use crate::media::{ MediaError, MediaFile };
use crate::simulated::Transport;


/// How much audio the producer reads ahead per step.
const CHUNK: Duration = Duration::from_secs( 1 );


/// Resolves sources whose url is a local path.
pub struct LocalResolver {
    transport: Arc<Transport>,
}


impl LocalResolver {
    pub fn new( transport: Arc<Transport> ) -> Self {
        Self { transport }
    }
}


#[async_trait]
impl StreamResolver for LocalResolver {
    async fn resolve(
        &self,
        source: &dyn AudioSource,
        options: &ResolveOptions,
    ) -> Result<ResolvedStream, PlaybackError> {
        let path = PathBuf::from( source.url() );
        let seek = options.seek_seconds;

        let file = tokio::task::spawn_blocking( move || -> Result<MediaFile, MediaError> {
            let mut file = MediaFile::open( &path )?;
            if seek > 0 {
                file.seek( seek as f64 )?;
            }
            Ok( file )
        })
        .await
        .map_err( |e| PlaybackError::Resolve( e.to_string() ) )??;

        let transcode = options.volume_transform_enabled || !options.effect_args.is_empty();
        let container = if transcode { ContainerType::Arbitrary } else { file.container() };
        let cost = stream_cost( container, options );

        tracing::debug!(
            "Resolved {} as {} (cost {}, bitrate {}, effects {:?})",
            source.url(),
            container,
            cost,
            options.bitrate,
            options.effect_args
        );

        let stream = Arc::new( SignalStream::new() );
        tokio::spawn( produce( file, stream.clone(), self.transport.clone() ) );

        Ok( ResolvedStream { stream, container, cost })
    }
}


/// One unit per pipeline stage the stream would need: a transcoder for
/// arbitrary input, plus one each for volume and filters.
fn stream_cost( container: ContainerType, options: &ResolveOptions ) -> u32 {
    let mut cost = if container.is_passthrough() { 0 } else { 2 };
    if options.volume_transform_enabled {
        cost += 1;
    }
    if !options.effect_args.is_empty() {
        cost += 1;
    }
    cost
}


/// Reads `file` a chunk at a time, holding each chunk for as long as it
/// takes to play. Gives up quietly once the stream is released.
async fn produce( mut file: MediaFile, stream: Arc<SignalStream>, transport: Arc<Transport> ) {
    let mut paused = transport.subscribe();
    loop {
        if stream.is_destroyed() {
            tracing::debug!( "Stream released before end of file" );
            return;
        }

        let read = tokio::task::spawn_blocking( move || {
            let mut buffered = Duration::ZERO;
            let mut eof = false;
            while buffered < CHUNK {
                match file.next_packet_duration()? {
                    Some( duration ) => buffered += duration,
                    None => {
                        eof = true;
                        break;
                    }
                }
            }
            Ok::<_, MediaError>( ( file, buffered, eof ) )
        }).await;

        let ( returned, buffered, eof ) = match read {
            Ok( Ok( chunk ) ) => chunk,
            Ok( Err( e ) ) => {
                tracing::warn!( "Stream cut short: {}", e );
                stream.end();
                return;
            }
            Err( e ) => {
                tracing::error!( "Stream producer failed: {}", e );
                return;
            }
        };
        file = returned;

        if paused.wait_for( |p| !*p ).await.is_err() {
            return;
        }
        tokio::time::sleep( transport.scale( buffered ) ).await;

        if eof {
            stream.end();
            return;
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_passthrough_is_free() {
        let options = ResolveOptions::default();
        assert_eq!( stream_cost( ContainerType::OggOpus, &options ), 0 );
        assert_eq!( stream_cost( ContainerType::Arbitrary, &options ), 2 );
    }


    #[test]
    fn test_transforms_add_cost() {
        let options = ResolveOptions {
            effect_args: vec![ "bass=g=5".into() ],
            volume_transform_enabled: true,
            ..Default::default()
        };
        assert_eq!( stream_cost( ContainerType::Arbitrary, &options ), 4 );
    }


    #[derive( Debug )]
    struct Missing;

    impl AudioSource for Missing {
        fn url( &self ) -> &str {
            "/nonexistent/cadenza/missing.flac"
        }

        fn title( &self ) -> &str {
            "missing"
        }

        fn length_seconds( &self ) -> u64 {
            0
        }
    }


    #[tokio::test]
    async fn test_missing_file_fails_to_resolve() {
        let resolver = LocalResolver::new( Arc::new( Transport::new( 1.0 ) ) );
        let result = resolver.resolve( &Missing, &ResolveOptions::default() ).await;
        assert!( matches!( result, Err( PlaybackError::Resolve( _ ) ) ) );
    }
}
