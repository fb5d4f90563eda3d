use anyhow::{Context, Result, bail};

/// Operator commands typed on the server's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Kick { peer_id: u16, reason: String },
    Status,
}

pub fn parse_admin(line: &str) -> Result<Option<AdminCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

    let command = match name {
        "kick" => {
            let rest = rest.trim_start();
            let (peer, reason) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if peer.is_empty() {
                bail!("usage: kick <peer id> [reason]");
            }
            let peer_id = peer
                .parse()
                .with_context(|| format!("invalid peer id `{peer}`"))?;
            let reason = match reason.trim() {
                "" => "kicked by operator",
                reason => reason,
            };
            AdminCommand::Kick {
                peer_id,
                reason: reason.to_string(),
            }
        }
        "status" => AdminCommand::Status,
        other => bail!("unknown command `{other}`, expected kick or status"),
    };
    Ok(Some(command))
}
