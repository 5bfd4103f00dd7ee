//! Sidecar side of the IPC channel
//!
//! [`serve`] answers the handshake and then runs requests against the engine one
//! at a time, in arrival order. Notifications produced by a request are written
//! right after its response.

use anyhow::{Context, bail};
use futures::{SinkExt, StreamExt};
use marmot_group::{CommitOutcome, Error, GroupId, MarmotEngine};
use marmot_storage_traits::MarmotStorageProvider;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::FrameCodec;
use crate::protocol::{
    ErrorCode, Frame, Notification, Op, Outcome, PROTOCOL_VERSION, Plaintext, Reply, WireError,
    decode_plaintext,
};

/// Why the serve loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The host sent `Shutdown`
    Shutdown,
    /// The host closed the channel
    Disconnected,
}

/// Serve `engine` over one host connection until it shuts down or disconnects
pub async fn serve<Storage, R, W>(
    engine: MarmotEngine<Storage>,
    reader: R,
    writer: W,
) -> anyhow::Result<Exit>
where
    Storage: MarmotStorageProvider,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match engine.finalize_removals() {
        Ok(groups) if !groups.is_empty() => {
            tracing::info!(target: "marmot_sidecar::daemon", groups = groups.len(), "Finalized expired removals");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(target: "marmot_sidecar::daemon", "Failed to finalize removals: {e}"),
    }

    let mut frames = FramedRead::new(reader, FrameCodec::new());
    let mut sink = FramedWrite::new(writer, FrameCodec::new());

    match frames.next().await {
        Some(Ok(Frame::Hello { protocol_version })) => {
            sink.send(Frame::Ready {
                protocol_version: PROTOCOL_VERSION,
                identity: engine.identity(),
            })
            .await
            .context("write ready")?;
            if protocol_version != PROTOCOL_VERSION {
                bail!("host speaks protocol {protocol_version}, sidecar speaks {PROTOCOL_VERSION}");
            }
        }
        Some(Ok(other)) => bail!("expected hello, got {other:?}"),
        Some(Err(e)) => return Err(e).context("read hello"),
        None => return Ok(Exit::Disconnected),
    }
    tracing::info!(target: "marmot_sidecar::daemon", identity = %engine.identity(), "Handshake complete");

    while let Some(frame) = frames.next().await {
        let frame = frame.context("read frame")?;
        let Frame::Request { id, op } = frame else {
            tracing::warn!(target: "marmot_sidecar::daemon", "Ignoring unexpected frame from host");
            continue;
        };

        let shutdown = matches!(op, Op::Shutdown);
        let name = op.name();
        let (outcome, notifications) = handle(&engine, op);
        if let Outcome::Error(e) = &outcome {
            tracing::debug!(target: "marmot_sidecar::daemon", id, op = name, code = ?e.code, "Request failed");
        }

        sink.send(Frame::Response { id, outcome })
            .await
            .context("write response")?;
        for notification in notifications {
            sink.send(Frame::Event(notification))
                .await
                .context("write event")?;
        }

        if shutdown {
            tracing::info!(target: "marmot_sidecar::daemon", "Shutdown requested");
            return Ok(Exit::Shutdown);
        }
    }
    Ok(Exit::Disconnected)
}

fn handle<Storage>(engine: &MarmotEngine<Storage>, op: Op) -> (Outcome, Vec<Notification>)
where
    Storage: MarmotStorageProvider,
{
    let mut notifications = Vec::new();
    let result = execute(engine, op, &mut notifications);
    match result {
        Ok(reply) => (Outcome::Ok(reply), notifications),
        Err(e) => (Outcome::Error(e), Vec::new()),
    }
}

fn execute<Storage>(
    engine: &MarmotEngine<Storage>,
    op: Op,
    notifications: &mut Vec<Notification>,
) -> Result<Reply, WireError>
where
    Storage: MarmotStorageProvider,
{
    let reply = match op {
        Op::CreateKeyPackage => Reply::KeyPackage(engine.create_key_package().map_err(wire)?),
        Op::CreateGroup => Reply::Group(engine.create_group().map_err(wire)?),
        Op::GetGroup { group_id } => Reply::Group(engine.get_group(&group_id).map_err(wire)?),
        Op::ListGroups => Reply::Groups(engine.list_groups().map_err(wire)?),
        Op::DeleteGroup { group_id } => {
            let summary = engine.delete_group(&group_id).map_err(wire)?;
            notifications.push(Notification::GroupClosed {
                group_id,
                epoch: summary.epoch,
            });
            Reply::Group(summary)
        }
        Op::ProposeAdd {
            group_id,
            key_package,
        } => Reply::Proposal(engine.propose_add(&group_id, key_package).map_err(wire)?),
        Op::ProposeRemove {
            group_id,
            leaf_index,
        } => Reply::Proposal(engine.propose_remove(&group_id, leaf_index).map_err(wire)?),
        Op::ProposeUpdate { group_id } => {
            Reply::Proposal(engine.propose_update(&group_id).map_err(wire)?)
        }
        Op::SignProposal { group_id, proposal } => Reply::ProposalMessage(
            engine
                .proposal_message(&group_id, proposal)
                .map_err(wire)?,
        ),
        Op::ReceiveProposal { message, event_id } => Reply::ProposalReceived(
            engine.receive_proposal(message, event_id).map_err(wire)?,
        ),
        Op::Commit {
            group_id,
            proposals,
        } => Reply::Commit(Some(engine.commit(&group_id, proposals).map_err(wire)?)),
        Op::CommitReceived { group_id } => {
            Reply::Commit(engine.commit_received_proposals(&group_id).map_err(wire)?)
        }
        Op::ApplyCommit { commit, event_id } => {
            let outcome = engine.apply_commit(&commit, event_id).map_err(wire)?;
            notifications.extend(commit_notifications(commit.group_id, &outcome));
            Reply::CommitApplied(outcome)
        }
        Op::Encrypt {
            group_id,
            plaintext,
        } => {
            let plaintext = decode_plaintext(&plaintext)
                .map_err(|e| WireError::new(ErrorCode::BadRequest, format!("plaintext: {e}")))?;
            Reply::Encrypted(engine.encrypt(&group_id, &plaintext).map_err(wire)?)
        }
        Op::Decrypt { message, event_id } => Reply::Decrypted(Plaintext::from(
            engine.decrypt(&message, event_id).map_err(wire)?,
        )),
        Op::ProcessWelcome { welcome, event_id } => {
            let summary = engine.process_welcome(&welcome, event_id).map_err(wire)?;
            notifications.push(Notification::GroupJoined {
                group_id: summary.group_id,
                epoch: summary.epoch,
                members: summary.members.len(),
            });
            Reply::Group(summary)
        }
        Op::Shutdown => Reply::Done,
    };
    Ok(reply)
}

fn commit_notifications(group_id: GroupId, outcome: &CommitOutcome) -> Vec<Notification> {
    let mut notifications: Vec<Notification> = outcome
        .discarded
        .iter()
        .map(|discarded| Notification::CommitDiscarded {
            group_id,
            epoch: discarded.epoch,
            event_id: discarded.event_id,
            added: discarded.added.clone(),
            removed: discarded.removed.clone(),
        })
        .collect();
    if outcome.self_removed {
        notifications.push(Notification::Removed {
            group_id,
            epoch: outcome.epoch,
        });
        return notifications;
    }
    notifications.push(Notification::EpochAdvanced {
        group_id,
        epoch: outcome.epoch,
        rolled_back_from: outcome.rolled_back_from,
    });
    if outcome.reinstated {
        notifications.push(Notification::Reinstated {
            group_id,
            epoch: outcome.epoch,
        });
    }
    notifications.extend(
        outcome
            .removed
            .iter()
            .map(|identity| Notification::MemberRemoved {
                group_id,
                epoch: outcome.epoch,
                identity: *identity,
            }),
    );
    notifications
}

fn wire(e: Error) -> WireError {
    WireError::from(&e)
}
