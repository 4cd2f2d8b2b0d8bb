//! Cadenza CLI - plays local files through a guild playback controller

mod cli;
mod console;
mod media;
mod resolver;
mod scan;
mod settings;
mod simulated;
mod track;

use std::sync::Arc;

use anyhow::{ bail, Context, Result };
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{ layer::SubscriberExt, util::SubscriberInitExt, EnvFilter };

use cadenza_core::{ PlayQueue, PlaybackController, PlaybackEvent, QueueItem, QueuePort };

use cli::Args;
use console::ConsoleNotifier;
use resolver::LocalResolver;
use settings::Settings;
use simulated::{ SimulatedConnection, Transport };
use track::LocalTrack;


/// Name shown as the requester of every queued file.
const REQUESTER: &str = "console";


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so notifications own stdout
    tracing_subscriber::registry()
        .with( EnvFilter::try_from_default_env().unwrap_or_else( |_| EnvFilter::new( "cadenza=info" ) ) )
        .with( tracing_subscriber::fmt::layer().with_writer( std::io::stderr ) )
        .init();

    let mut settings = Settings::load();
    settings.apply( &args );
    if args.save_settings {
        settings.save();
    }

    let queue = Arc::new( PlayQueue::new() );
    let paths = scan::collect( &args.files ).context( "Failed to collect audio files" )?;
    for path in &paths {
        match LocalTrack::probe( path ) {
            Ok( track ) => {
                tracing::debug!( "Queued {:?}", track.path() );
                queue.add( QueueItem::new( Arc::new( track ), REQUESTER ) );
            }
            Err( e ) => tracing::warn!( "Skipping {:?}: {}", path, e ),
        }
    }
    if queue.is_empty() {
        bail!( "No playable audio files among {} path(s)", args.files.len() );
    }
    queue.set_loop_enabled( args.track_loop );
    queue.set_queue_loop_enabled( args.queue_loop );

    let transport = Arc::new( Transport::new( args.speed ) );
    let controller = PlaybackController::new(
        args.guild.clone(),
        settings.playback.clone(),
        queue.clone(),
        Arc::new( LocalResolver::new( transport.clone() ) ),
        Some( Arc::new( ConsoleNotifier ) ),
    );
    controller.set_volume( settings.volume );
    controller.set_effect_args( settings.effect_args.clone() );
    controller.attach_connection( Arc::new( SimulatedConnection::new( "local-voice", settings.bitrate, transport ) ) );

    let mut events = controller.subscribe();

    let starter = controller.clone();
    let seek = args.seek;
    tokio::spawn( async move {
        starter.play( seek, false ).await;
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!( ctrl_c );

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context( "Failed to listen for Ctrl-C" )?;
                tracing::info!( "Interrupted, leaving voice" );
                controller.disconnect().await;
                break;
            }
            event = events.recv() => match event {
                Ok( PlaybackEvent::Disconnect ) | Err( broadcast::error::RecvError::Closed ) => break,
                Ok( PlaybackEvent::ReportPlaybackDuration { duration, error_count } ) => {
                    tracing::info!( "Played for {:.1}s ({} errors)", duration.as_secs_f64(), error_count );
                }
                Ok( event ) => tracing::debug!( "Event: {}", event.name() ),
                Err( broadcast::error::RecvError::Lagged( missed ) ) => {
                    tracing::warn!( "Missed {} playback events", missed );
                }
            },
        }
    }

    Ok(())
}
