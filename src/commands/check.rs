use anyhow::Result;
use kube::Client;

use sdn_zerotrust::config::Config;
use sdn_zerotrust::repository::{PolicyRepository, PostgresRepository};

pub async fn run() -> Result<()> {
    println!("Running controller preflight checks...\n");

    // 1. Configuration (DATABASE_URL is the only fatal requirement)
    print!("  Configuration ............... ");
    let config = match Config::from_env() {
        Ok(config) => {
            println!("OK");
            config
        }
        Err(e) => {
            println!("FAIL");
            return Err(e);
        }
    };

    // 2. Policy repository reachability and readability
    print!("  Policy repository ........... ");
    let repository = PostgresRepository::new(config.database_url.clone());
    match repository.fetch_enabled().await {
        Ok(policies) => println!("OK ({} enabled policies)", policies.len()),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {e:#}");
            println!("  Hint:  Is the repository running? Check DATABASE_URL.\n");
        }
    }

    // 3. Orchestrator reachability (pod watch + coordination lease)
    print!("  Orchestrator connection ..... ");
    match Client::try_default().await {
        Ok(client) => match client.apiserver_version().await {
            Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
            Err(e) => println!("FAIL ({e})"),
        },
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\n  Coordination endpoints ...... {}", config.zk_hosts.join(","));
    println!("  Election lease .............. {}", config.lease_name());
    println!("  Policy poll interval ........ {}s", config.poll_interval.as_secs());
    println!("  Switch listen port .......... {}", config.switch_listen_port);

    println!("\nAll checks completed.");
    Ok(())
}
