mod session;

use std::env;
use std::io::{self, Write};
use std::process;
use std::time::Duration;

use crossterm::QueueableCommand;
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use session::{RunOptions, Scenario, Session, TranscriptLine, TranscriptRole};

const USAGE: &str = "Usage: bilateral-emulator [--scenario <session|outage|emergency|battery>] \
[--latency-ms N] [--loss-pct N] [--skew-ms N] [--drift-ppm N] [--session-s N] [--outage-ms N] \
[--seed N] [--verbose]";

fn main() -> io::Result<()> {
    let (scenario, options) = parse_args(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    writeln!(
        writer,
        "Bilateral emulator: {} scenario, transcript at {}",
        scenario.tag(),
        scenario.log_path()
    )?;

    let mut session = Session::new(scenario, options)?;
    let mut console_error = None;
    let summary = session.run(|line| {
        if console_error.is_none()
            && let Err(err) = print_line(&mut writer, line)
        {
            console_error = Some(err);
        }
    })?;
    if let Some(err) = console_error {
        return Err(err);
    }

    writer.flush()?;
    if summary.primary_state.is_error() || summary.secondary_state.is_error() {
        process::exit(1);
    }
    Ok(())
}

fn print_line(writer: &mut impl Write, line: &TranscriptLine) -> io::Result<()> {
    let color = match line.role {
        TranscriptRole::Host => Color::Yellow,
        TranscriptRole::Primary => Color::Cyan,
        TranscriptRole::Secondary => Color::Magenta,
        TranscriptRole::Link => Color::DarkGrey,
    };
    writer
        .queue(Print(format!("[+{:>6} ms] ", line.elapsed.as_millis())))?
        .queue(SetForegroundColor(color))?
        .queue(Print(line.role.prefix()))?
        .queue(ResetColor)?
        .queue(Print(format!(" {}\n", line.text)))?;
    Ok(())
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(Scenario, RunOptions), String> {
    let mut scenario = Scenario::Session;
    let mut options = RunOptions::DEFAULT;

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        if flag == "--verbose" {
            options.verbose = true;
            continue;
        }

        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("Expected value after {flag}"))?,
        };
        match flag.as_str() {
            "--scenario" => scenario = Scenario::from_tag(&value)?,
            "--latency-ms" => options.link.latency = Duration::from_millis(number(&flag, &value)?),
            "--loss-pct" => {
                let percent: u8 = number(&flag, &value)?;
                if percent > 100 {
                    return Err(format!("{flag} must be at most 100"));
                }
                options.link.loss_percent = percent;
            }
            "--skew-ms" => options.link.skew = Duration::from_millis(number(&flag, &value)?),
            "--drift-ppm" => options.link.drift_ppm = number(&flag, &value)?,
            "--session-s" => options.session = Duration::from_secs(number(&flag, &value)?),
            "--outage-ms" => options.outage = Duration::from_millis(number(&flag, &value)?),
            "--seed" => options.seed = number(&flag, &value)?,
            _ => return Err(format!("Unknown flag `{flag}`")),
        }
    }

    Ok((scenario, options))
}

fn number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value `{value}` for {flag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(ToString::to_string).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn flags_override_the_link_model() {
        let (scenario, options) = parse_args(args(&[
            "--scenario",
            "outage",
            "--loss-pct=10",
            "--skew-ms",
            "40",
            "--verbose",
        ]))
        .expect("valid flags");

        assert_eq!(scenario, Scenario::Outage);
        assert_eq!(options.link.loss_percent, 10);
        assert_eq!(options.link.skew, Duration::from_millis(40));
        assert!(options.verbose);
    }

    #[test]
    fn bad_values_are_reported() {
        assert!(parse_args(args(&["--loss-pct", "101"])).is_err());
        assert!(parse_args(args(&["--seed"])).is_err());
        assert!(parse_args(args(&["--scenario", "reboot"])).is_err());
    }
}
