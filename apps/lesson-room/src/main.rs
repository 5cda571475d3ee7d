mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;

use cli::{Cli, Command, JoinArgs};
use lesson_room_core::api::{AuthClient, LessonClient};
use lesson_room_core::config::RoomConfig;
use lesson_room_core::media::StaticSampleDevices;
use lesson_room_core::peer::RtcPeerFactory;
use lesson_room_core::room::{ReqwestRoomBackend, RoomMembership};
use lesson_room_core::session::{
    RoomSession, SessionContext, SessionDeps, SessionError, ensure_joinable,
};
use lesson_room_core::signaling::WebSocketConnector;
use lesson_room_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init(&cli.logging.to_config())?;

    match cli.command {
        Command::Join(args) => join(args).await,
    }
}

async fn join(args: JoinArgs) -> anyhow::Result<()> {
    let config = RoomConfig::from_env().map_err(|err| SessionError::Config(err.to_string()))?;

    let lessons = LessonClient::new(config.api_base.clone(), args.token.clone())?;
    let lesson = lessons
        .lesson(args.lesson)
        .await
        .with_context(|| format!("fetching lesson {}", args.lesson))?;
    ensure_joinable(&lesson, OffsetDateTime::now_utc())?;

    let backend = ReqwestRoomBackend::new(config.api_base.clone(), args.token.clone())?;
    let membership = RoomMembership::new(
        Arc::new(backend),
        args.lesson.to_string(),
        config.roster_poll_interval,
    );
    membership.join().await.context("joining room")?;
    let roster = membership.poll_roster();

    let deps = SessionDeps {
        devices: Arc::new(StaticSampleDevices::new()),
        connector: Arc::new(WebSocketConnector::new(config.signaling_url.clone())),
        refresher: Arc::new(AuthClient::new(
            config.api_base.clone(),
            args.refresh_token.clone(),
        )?),
        peers: Arc::new(RtcPeerFactory::new(config.rtc_ice_servers())?),
    };
    let context = SessionContext {
        lesson_id: args.lesson,
        local_user_id: args.user,
        auth_token: args.token,
    };
    let room = match RoomSession::start(context, &config, deps).await {
        Ok(room) => room,
        Err(err) => {
            roster.stop();
            let _ = membership.leave().await;
            return Err(err.into());
        }
    };

    let mut snapshots = room.subscribe();
    let mut events = room.events();
    let mut participants = roster.subscribe();
    let failure = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break None;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                tracing::info!(
                    target = "lesson_room",
                    channel = ?snapshot.channel,
                    quality = ?snapshot.quality,
                    view = ?snapshot.view.selection,
                    bound = ?snapshot.view.bound.as_ref().map(|record| record.peer_id),
                    peers = ?snapshot.peers,
                    "room updated"
                );
                if snapshot.ended {
                    break snapshot.error;
                }
            }
            event = events.recv() => match event {
                Ok(event) => tracing::info!(target = "lesson_room", ?event, "room event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "lesson_room", skipped, "room events lagged");
                }
                Err(RecvError::Closed) => break None,
            },
            Ok(()) = participants.changed() => {
                let list = participants.borrow_and_update().clone();
                tracing::info!(target = "lesson_room", participants = ?list, "roster updated");
            }
        }
    };

    roster.stop();
    room.leave().await;
    let _ = membership.leave().await;

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
