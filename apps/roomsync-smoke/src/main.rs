mod logging;

use std::{process::ExitCode, sync::Arc};

use roomsync_core::{InviteNotice, LeaveNotice, RoomEvent, StatusStream, SyncError};
use roomsync_matrix::{ClientConfig, ErrorHandler, HttpTransport, SyncClient};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting roomsync-smoke");

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            return ExitCode::FAILURE;
        }
    };
    info!(homeserver = %config.homeserver, ?config.sync, "configuration loaded");

    let transport = match HttpTransport::new(config.transport_config()) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "cannot build transport");
            return ExitCode::FAILURE;
        }
    };
    match transport.whoami().await {
        Ok(user_id) => info!(%user_id, "authenticated"),
        Err(err) => {
            error!(error = %err, "access token rejected");
            return ExitCode::FAILURE;
        }
    }

    let client = SyncClient::new(transport, config.sync.clone());
    register_listeners(&client);

    let on_error: ErrorHandler = Arc::new(|err: &SyncError| {
        warn!(code = %err.code, error = %err, "sync error; continuing");
    });
    if let Err(err) = client.start(None, Some(on_error)).await {
        error!(error = %err, "cannot start sync loop");
        return ExitCode::FAILURE;
    }

    let mut status = client.subscribe_status();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "cannot listen for ctrl-c; stopping");
            }
            info!("shutdown requested");
        }
        () = wait_for_halt(&mut status) => {
            warn!("sync loop stopped on its own");
        }
    }

    match client.stop().await {
        Ok(()) => {
            info!(rooms = client.rooms().len(), "sync loop stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "sync loop halted");
            ExitCode::FAILURE
        }
    }
}

/// Resolve once the loop reports it is no longer running.
async fn wait_for_halt(status: &mut StatusStream) {
    loop {
        match status.recv().await {
            Ok(update) if !update.running => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return,
        }
    }
}

fn register_listeners(client: &SyncClient<HttpTransport>) {
    client.add_listener(
        |event: &RoomEvent| {
            info!(
                room_id = event.room_id.as_deref().unwrap_or_default(),
                sender = event.sender.as_deref().unwrap_or_default(),
                event_type = %event.event_type,
                body = event.content_str("body").unwrap_or_default(),
                "timeline event"
            );
            Ok(())
        },
        None,
    );
    client.add_presence_listener(|event: &RoomEvent| {
        info!(
            user_id = event.sender.as_deref().unwrap_or_default(),
            presence = event.content_str("presence").unwrap_or_default(),
            "presence"
        );
        Ok(())
    });
    client.add_invite_listener(|notice: &InviteNotice| {
        info!(room_id = %notice.room_id, state_events = notice.invite_state.len(), "invited");
        Ok(())
    });
    client.add_leave_listener(|notice: &LeaveNotice| {
        info!(room_id = %notice.room_id, "left room");
        Ok(())
    });
    client.add_ephemeral_listener(
        |event: &RoomEvent| {
            info!(
                room_id = event.room_id.as_deref().unwrap_or_default(),
                event_type = %event.event_type,
                "ephemeral event"
            );
            Ok(())
        },
        Some("m.typing"),
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roomsync_core::SyncStatusChannel;

    use super::*;

    #[tokio::test]
    async fn halt_wait_survives_lagged_receiver() {
        let channel = SyncStatusChannel::new(1);
        let mut status = channel.subscribe();
        for _ in 0..3 {
            channel.emit_running();
        }

        let pending =
            tokio::time::timeout(Duration::from_millis(50), wait_for_halt(&mut status)).await;
        assert!(pending.is_err(), "lagging behind running updates is not a halt");

        channel.emit_stopped(Some("listener_fault"));
        tokio::time::timeout(Duration::from_secs(1), wait_for_halt(&mut status))
            .await
            .expect("stopped status ends the wait");
    }
}
