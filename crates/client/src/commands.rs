use anyhow::{Context, Result, bail};
use glam::{IVec3, Vec3};

use voxlink::{Channel, Command};

pub const HELP: &str = "\
/move x y z        walk to a position
/look yaw pitch    turn (degrees)
/dig x y z         dig a block
/place x y z item  place a block
/slot n            select a hotbar slot
/stats             show network statistics
/quit              disconnect and exit
anything else is sent as chat";

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Send(Command),
    SendOn(Command, Channel),
    Stats,
    Help,
    Quit,
}

/// Parses one line typed at the prompt. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Input>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Input::Send(Command::chat(line))));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let input = match name {
        "move" => {
            let [x, y, z] = floats::<3>(&args)?;
            Input::Send(Command::move_to(Vec3::new(x, y, z)))
        }
        "look" => {
            let [yaw, pitch] = floats::<2>(&args)?;
            // Looking around is fire-and-forget.
            Input::SendOn(
                Command::LookAt {
                    yaw: yaw.to_radians(),
                    pitch: pitch.to_radians(),
                },
                Channel::Unreliable,
            )
        }
        "dig" => Input::Send(Command::DigBlock {
            pos: block(&args)?,
        }),
        "place" => {
            let Some(item) = args.get(3) else {
                bail!("usage: /place x y z item");
            };
            Input::Send(Command::PlaceBlock {
                pos: block(&args[..3])?,
                item: item.to_string(),
            })
        }
        "slot" => {
            let [slot] = args.as_slice() else {
                bail!("usage: /slot n");
            };
            let slot = slot
                .parse()
                .with_context(|| format!("invalid slot `{slot}`"))?;
            Input::Send(Command::SelectSlot { slot })
        }
        "stats" => Input::Stats,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => bail!("unknown command /{other}, try /help"),
    };
    Ok(Some(input))
}

fn floats<const N: usize>(args: &[&str]) -> Result<[f32; N]> {
    if args.len() != N {
        bail!("expected {N} numbers, got {}", args.len());
    }
    let mut values = [0.0f32; N];
    for (value, arg) in values.iter_mut().zip(args) {
        *value = arg
            .parse()
            .with_context(|| format!("invalid number `{arg}`"))?;
        if !value.is_finite() {
            bail!("invalid number `{arg}`");
        }
    }
    Ok(values)
}

fn block(args: &[&str]) -> Result<IVec3> {
    if args.len() != 3 {
        bail!("expected block coordinates x y z");
    }
    let mut coords = [0i32; 3];
    for (coord, arg) in coords.iter_mut().zip(args) {
        *coord = arg
            .parse()
            .with_context(|| format!("invalid coordinate `{arg}`"))?;
    }
    Ok(IVec3::from_array(coords))
}
