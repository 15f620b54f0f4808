use std::io;
use std::time::Duration;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{RunOptions, Scenario, Session};

fn main() -> io::Result<()> {
    for scenario in Scenario::ALL {
        record_scenario(scenario)?;
    }
    Ok(())
}

fn record_scenario(scenario: Scenario) -> io::Result<()> {
    let mut options = RunOptions::DEFAULT;
    match scenario {
        Scenario::Session => {
            options.session = Duration::from_secs(10);
            options.link.loss_percent = 5;
            options.verbose = true;
        }
        Scenario::Outage => options.outage = Duration::from_millis(2_500),
        Scenario::Emergency => options.verbose = true,
        Scenario::Battery => {}
    }

    let mut session = Session::new(scenario, options)?;
    let summary = session.run(|_| {})?;
    println!("{summary}");
    Ok(())
}
