use std::{process::ExitCode, time::Duration};

use clap::Parser;
use pagewatch::{
	cli::args::Cli,
	consumer::ConsumerLoop,
	lifecycle::{AyaBackend, Controller},
	report::ConsoleReporter,
	Config, Result,
};
use tokio::{signal, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
#[rustfmt::skip]
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
	let args = Cli::parse();
	tracing_subscriber::fmt()
		.with_target(false)
		.with_writer(std::io::stderr)
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	match run(args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("{err}");
			ExitCode::from(err.exit_code())
		}
	}
}

async fn run(args: Cli) -> Result<()> {
	let config = Config::try_from(args)?;

	// Bump the memlock rlimit. This is needed for older kernels that don't use the
	// new memcg based accounting, see https://lwn.net/Articles/837122/
	let rlim = libc::rlimit {
		rlim_cur: libc::RLIM_INFINITY,
		rlim_max: libc::RLIM_INFINITY,
	};
	let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
	if ret != 0 {
		debug!("remove limit on locked memory failed, ret is: {ret}");
	}

	let backend = AyaBackend::new(config.object.clone(), config.transport, config.page_shift);
	let mut controller = Controller::new(backend);
	controller.start(config.hooks)?;
	let transport = controller.take_transport()?;

	let cancel = CancellationToken::new();
	tokio::spawn(watch_shutdown(cancel.clone(), config.duration));

	let mut consumer = ConsumerLoop::new(transport, ConsoleReporter::stdout(), cancel.clone())
		.with_poll_timeout(config.poll_timeout)
		.with_batch(config.batch)
		.with_filter(config.filter);
	let outcome = consumer.run().await;
	cancel.cancel();

	match controller.dropped_events() {
		Ok(0) => {}
		Ok(dropped) => warn!("{dropped} events dropped, transport full"),
		Err(err) => debug!("drop counter unavailable: {err}"),
	}
	if let Ok(stats) = &outcome {
		info!(
			"{} records received, {} reported, {} filtered",
			stats.received, stats.reported, stats.filtered
		);
		if stats.lost > 0 {
			warn!("{} events lost by the perf buffers", stats.lost);
		}
	}

	let teardown = controller.teardown();
	outcome?;
	teardown
}

async fn watch_shutdown(cancel: CancellationToken, duration: Option<Duration>) {
	let deadline = async {
		match duration {
			Some(duration) => time::sleep(duration).await,
			None => std::future::pending().await,
		}
	};

	tokio::select! {
		res = signal::ctrl_c() => match res {
			Ok(()) => info!("interrupt received, shutting down"),
			Err(err) => warn!("failed to listen for ctrl-c: {err}"),
		},
		_ = deadline => info!("run duration elapsed, shutting down"),
		_ = cancel.cancelled() => {}
	}
	cancel.cancel();
}
