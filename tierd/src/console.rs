// SPDX-License-Identifier: GPL-2.0
//
// Interactive console. Lines from stdin become agent requests; `exit` is
// the daemon's primary shutdown trigger. Parse errors never reach the
// control loops — bad input costs a usage message and nothing else.

use std::io::BufRead;
use std::sync::Arc;

use log::warn;

use crate::placement::PlacementEngine;
use crate::state::Component;
use crate::tier::{MigrationMode, Tier, MAX_PID};

const HELP: &str = "Available commands:
\tbind <pid>
\tunbind <pid>
\tDEBUG: send <n> <dram|nvram>       migrate n pages into the given tier
\tDEBUG: nvramwrchk <n>              pull n write-heavy pages out of NVRAM
\tDEBUG: baldram <n>                 drain n permille of DRAM traffic
\tDEBUG: balnvram <n>                drain n permille of NVRAM traffic
\tDEBUG: toggle <nvramwrchk|thresh|bal|all>
\tDEBUG: stats [json]
\tDEBUG: clear
\texit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Bind(i32),
    Unbind(i32),
    /// Migrate `count` pages into `dest`.
    Send { count: i32, dest: Tier },
    WriteCheck(i32),
    /// Drain `permill` of the tier's traffic (parts per thousand).
    Balance { permill: i32, source: Tier },
    Toggle(ToggleTarget),
    Stats { json: bool },
    Clear,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleTarget {
    Writecheck,
    Threshold,
    Balance,
    All,
}

fn parse_pid(arg: Option<&str>, cmd: &str) -> Result<i32, String> {
    let pid = arg
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(|| format!("Invalid argument for {} command.", cmd))?;
    if pid > 0 && pid < MAX_PID {
        Ok(pid)
    } else {
        Err(format!("Invalid argument for {} command.", cmd))
    }
}

fn parse_count(arg: Option<&str>, cmd: &str) -> Result<i32, String> {
    arg.and_then(|s| s.parse::<i32>().ok())
        .filter(|&n| n >= 0)
        .ok_or_else(|| format!("Invalid argument for {} command.", cmd))
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Err(String::new()); // blank line, no message
    };

    let parsed = match cmd {
        "bind" => Command::Bind(parse_pid(words.next(), "bind")?),
        "unbind" => Command::Unbind(parse_pid(words.next(), "unbind")?),
        "send" => {
            let count = parse_count(words.next(), "send")?;
            let dest = match words.next() {
                Some("dram") => Tier::Dram,
                Some("nvram") => Tier::Nvram,
                _ => return Err("Invalid argument for send command.".to_string()),
            };
            Command::Send { count, dest }
        }
        "nvramwrchk" => Command::WriteCheck(parse_count(words.next(), "nvramwrchk")?),
        "baldram" => Command::Balance {
            permill: parse_count(words.next(), "baldram")?,
            source: Tier::Dram,
        },
        "balnvram" => Command::Balance {
            permill: parse_count(words.next(), "balnvram")?,
            source: Tier::Nvram,
        },
        "toggle" => match words.next() {
            Some("nvramwrchk") => Command::Toggle(ToggleTarget::Writecheck),
            Some("thresh") => Command::Toggle(ToggleTarget::Threshold),
            Some("bal") => Command::Toggle(ToggleTarget::Balance),
            Some("all") => Command::Toggle(ToggleTarget::All),
            _ => return Err("Invalid argument for toggle command.".to_string()),
        },
        "stats" => Command::Stats {
            json: words.next() == Some("json"),
        },
        "clear" | "clr" => Command::Clear,
        "exit" => Command::Exit,
        _ => return Err(format!("Unknown command.\n{}", HELP)),
    };

    if words.next().is_some() {
        return Err(format!("Trailing arguments.\n{}", HELP));
    }
    Ok(parsed)
}

fn toggle_report(engine: &PlacementEngine, comp: Component) {
    let on = engine.state.toggle(comp);
    println!(
        "{} component turned {}",
        comp.label(),
        if on { "ON" } else { "OFF" }
    );
}

fn dispatch(engine: &PlacementEngine, cmd: Command) {
    match cmd {
        Command::Bind(pid) => match engine.bind(pid) {
            Ok(true) => println!("Bind request success (pid={}).", pid),
            Ok(false) => eprintln!("Bind request failed (pid={}).", pid),
            Err(e) => eprintln!("Bind request failed (pid={}): {:#}", pid, e),
        },
        Command::Unbind(pid) => match engine.unbind(pid) {
            Ok(true) => println!("Unbind request success (pid={}).", pid),
            Ok(false) => eprintln!("Unbind request failed (pid={}).", pid),
            Err(e) => eprintln!("Unbind request failed (pid={}): {:#}", pid, e),
        },
        Command::Send { count, dest } => {
            match engine.place(count, MigrationMode::into_tier(dest)) {
                Ok(n) if n > 0 => println!("Migrated {} out of {} pages.", n, count),
                Ok(_) => {}
                Err(e) => eprintln!("Send request failed: {:#}", e),
            }
        }
        Command::WriteCheck(count) => {
            match engine.place(count, MigrationMode::NvramWriteback) {
                Ok(n) if n > 0 => {
                    println!("NVRAM->DRAM: sent {} out of {} write-heavy pages.", n, count)
                }
                Ok(_) => {}
                Err(e) => eprintln!("Write check request failed: {:#}", e),
            }
        }
        Command::Balance { permill, source } => {
            let mode = match source {
                Tier::Dram => MigrationMode::BalanceDram,
                Tier::Nvram => MigrationMode::BalanceNvram,
            };
            match engine.place(permill, mode) {
                Ok(n) if n > 0 => println!(
                    "{}->{}: balanced {} pages out of {:.1}%.",
                    source,
                    source.other(),
                    n,
                    permill as f32 / 10.0
                ),
                Ok(_) => {}
                Err(e) => eprintln!("Balance request failed: {:#}", e),
            }
        }
        Command::Toggle(target) => match target {
            ToggleTarget::Writecheck => toggle_report(engine, Component::Writecheck),
            ToggleTarget::Threshold => toggle_report(engine, Component::Threshold),
            ToggleTarget::Balance => toggle_report(engine, Component::Balance),
            ToggleTarget::All => {
                toggle_report(engine, Component::Writecheck);
                toggle_report(engine, Component::Threshold);
                toggle_report(engine, Component::Balance);
            }
        },
        Command::Stats { json } => {
            let snap = engine.metrics.snapshot();
            if json {
                match serde_json::to_string_pretty(&snap) {
                    Ok(s) => println!("{}", s),
                    Err(e) => warn!("Failed to serialize stats: {}", e),
                }
            } else if let Err(e) = snap.format(&mut std::io::stdout()) {
                warn!("Failed to format stats: {}", e);
            }
        }
        Command::Clear => {
            print!("\x1b[2J\x1b[H");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        Command::Exit => {}
    }
}

/// Console thread body. Returns once `exit` is read or stdin closes, after
/// triggering shutdown either way.
pub fn run_console(engine: Arc<PlacementEngine>) {
    println!("{}", HELP);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match parse_command(&line) {
            Ok(Command::Exit) => break,
            Ok(cmd) => dispatch(&engine, cmd),
            Err(msg) if msg.is_empty() => {}
            Err(msg) => eprintln!("{}", msg),
        }
    }

    engine.state.shutdown.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_with_pid_bounds() {
        assert_eq!(parse_command("bind 1234").unwrap(), Command::Bind(1234));
        assert!(parse_command("bind 0").is_err());
        assert!(parse_command("bind 32768").is_err());
        assert!(parse_command("bind -4").is_err());
        assert!(parse_command("bind abc").is_err());
        assert!(parse_command("bind").is_err());
    }

    #[test]
    fn parses_send_with_destination_tier() {
        assert_eq!(
            parse_command("send 100 dram").unwrap(),
            Command::Send {
                count: 100,
                dest: Tier::Dram
            }
        );
        assert_eq!(
            parse_command("send 5 nvram").unwrap(),
            Command::Send {
                count: 5,
                dest: Tier::Nvram
            }
        );
        assert!(parse_command("send 5 floppy").is_err());
        assert!(parse_command("send nvram").is_err());
    }

    #[test]
    fn parses_balance_and_toggle() {
        assert_eq!(
            parse_command("baldram 250").unwrap(),
            Command::Balance {
                permill: 250,
                source: Tier::Dram
            }
        );
        assert_eq!(
            parse_command("toggle bal").unwrap(),
            Command::Toggle(ToggleTarget::Balance)
        );
        assert_eq!(
            parse_command("toggle all").unwrap(),
            Command::Toggle(ToggleTarget::All)
        );
        assert!(parse_command("toggle everything").is_err());
    }

    #[test]
    fn parses_misc() {
        assert_eq!(parse_command("exit").unwrap(), Command::Exit);
        assert_eq!(parse_command("clear").unwrap(), Command::Clear);
        assert_eq!(
            parse_command("stats json").unwrap(),
            Command::Stats { json: true }
        );
        assert_eq!(
            parse_command("  nvramwrchk 64 ").unwrap(),
            Command::WriteCheck(64)
        );
    }

    #[test]
    fn blank_line_is_silent_and_junk_is_not() {
        assert_eq!(parse_command("   "), Err(String::new()));
        assert!(parse_command("frobnicate").unwrap_err().contains("Unknown"));
        assert!(parse_command("bind 12 34").unwrap_err().contains("Trailing"));
    }
}
