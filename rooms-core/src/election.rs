//! Host election: claim the room's host identity, or join whoever holds it.

use std::sync::Arc;

use tokio::time;

use crate::config::RoomConfig;
use crate::error::{ErrorKind, RoomError};
use crate::identity::RoomId;
use crate::member::{Member, RoleKind};
use crate::transport::Transport;

/// Return a connected member of `room`, as host or participant.
///
/// Each cycle tries to claim the host identity; if it is taken, joins the
/// current host; if that host is gone, waits `election_retry_delay` and starts
/// over. With `first == Participant` the first cycle skips the claim. Errors
/// other than `unavailable-id` (claim) and `peer-unavailable` (join) end the
/// election.
pub async fn join_or_host(
    transport: Arc<dyn Transport>,
    room: &RoomId,
    first: RoleKind,
    config: &RoomConfig,
) -> Result<Member, RoomError> {
    let limit = config.election_retry_limit;
    let mut claim = first == RoleKind::Host;

    for cycle in 0..limit {
        if claim {
            let mut host = Member::new(transport.clone(), RoleKind::Host, config.clone());
            match host.connect(room).await {
                Ok(()) => {
                    tracing::info!(room = %room, cycle, "claimed host");
                    return Ok(host);
                }
                Err(e) if e.transport_kind() == Some(ErrorKind::UnavailableId) => {
                    tracing::debug!(room = %room, cycle, "host identity taken, joining");
                }
                Err(e) => return Err(e),
            }
        }
        claim = true;

        let mut participant = Member::new(transport.clone(), RoleKind::Participant, config.clone());
        match participant.connect(room).await {
            Ok(()) => {
                tracing::info!(room = %room, cycle, "joined as participant");
                return Ok(participant);
            }
            Err(e) if e.transport_kind() == Some(ErrorKind::PeerUnavailable) => {
                tracing::debug!(room = %room, cycle, "host unavailable");
            }
            Err(e) => return Err(e),
        }

        if cycle + 1 < limit {
            time::sleep(config.election_retry_delay()).await;
        }
    }

    tracing::warn!(room = %room, cycles = limit, "no host could be claimed or joined");
    Err(RoomError::RoomUnavailable {
        room: room.clone(),
        cycles: limit,
    })
}
