use std::{path::PathBuf, process};

use anyhow::anyhow;
use structopt::StructOpt;
use tracing_futures::Instrument;
use tracing_subscriber::*;
use xaynet_secagg::{
    channel::Role,
    fanout::FanoutClient,
    protocol::{Arbiter, DataParty, Dataset},
    settings::Settings,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Secure aggregation party")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let party = settings.party();
    let local = settings.local_endpoint().cloned();
    let peers = settings.remote_endpoints();
    let Settings {
        log: log_settings,
        task,
        channel: channel_settings,
        protocol: protocol_settings,
        mask: mask_settings,
        data: data_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let run = async {
        let local = local.ok_or_else(|| anyhow!("no endpoint for {}", party))?;
        let dataset = match data_settings.path {
            Some(path) if party.role != Role::Arbiter => Some(Dataset::load(path)?),
            _ => None,
        };

        let client = FanoutClient::connect(&local, &peers, task, &channel_settings).await?;
        if party.role == Role::Arbiter {
            let outcome = Arbiter::new(client, protocol_settings, mask_settings)?
                .run()
                .await?;
            info!(
                "losses of {} epochs: {:?}, best epoch {:?}",
                outcome.iterations, outcome.losses, outcome.best_iter
            );
        } else {
            let dataset = dataset.ok_or_else(|| anyhow!("no dataset for {}", party))?;
            let outcome = DataParty::new(client, dataset, protocol_settings, mask_settings)?
                .run()
                .await?;
            info!(
                "final parameters of epoch {:?}: {:?}",
                outcome.best_iter, outcome.params
            );
        }
        Ok::<_, anyhow::Error>(())
    };

    if let Err(err) = run.instrument(info_span!("run", %party)).await {
        error!("{}: {:#}", party, err);
        process::exit(1);
    }
}
