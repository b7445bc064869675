//! `warden run`: bandit-selected episodes against a workspace.

use std::path::Path;

use tracing::{error, info};

use warden_core::gate::Ruleset;
use warden_kernel::config::WardenConfig;
use warden_kernel::controller::{Controller, ControllerConfig};
use warden_kernel::episode::{
    CancelToken, Clock, EpisodeRunner, StubProposer, SystemClock,
};
use warden_kernel::ledger::Ledger;
use warden_kernel::outcomes::OutcomeStore;
use warden_kernel::runner::SubprocessRunner;

/// The fixed arm registry the stub proposer understands.
const ARMS: &[&str] = &["tests_only", "diff_then_tests", "grep_then_tests"];

const EXIT_OK: u8 = 0;
const EXIT_IO: u8 = 4;
const EXIT_USAGE: u8 = 64;

/// Runs `episodes` episodes and records rewards. Returns the process
/// exit code.
pub fn execute(workspace: &Path, episodes: u32) -> u8 {
    let mut config = WardenConfig::from_env();
    config.workspace = workspace.to_path_buf();

    let violations = config.validate();
    if !violations.is_empty() {
        for v in &violations {
            error!("config: {v}");
        }
        return EXIT_USAGE;
    }
    let key = match config.kernel_key() {
        Ok(key) => key,
        Err(e) => {
            error!("config: {e}");
            return EXIT_USAGE;
        },
    };

    let mut ledger = match Ledger::open(
        &config.ledger_path(),
        &config.checkpoint_path(),
        config.checkpoint_interval,
    ) {
        Ok(ledger) => ledger,
        Err(e) => {
            error!("ledger: {e}");
            return EXIT_IO;
        },
    };

    let mut store = match OutcomeStore::open(&config.outcomes_db) {
        Ok(store) => store,
        Err(e) => {
            error!("outcomes: {e}");
            return EXIT_IO;
        },
    };
    let mut sampler = match store.load_sampler(ARMS.iter().copied()) {
        Ok(sampler) => sampler,
        Err(e) => {
            error!("outcomes: {e}");
            return EXIT_IO;
        },
    };

    let controller_config = ControllerConfig {
        action_timeout: config.action_timeout,
        tests_timeout: config.tests_timeout,
        stream_cap: config.stream_cap_bytes,
        grace: std::time::Duration::from_secs(warden_kernel::config::TERM_GRACE_S),
        ruleset: Ruleset::default(),
    };
    let mut controller = Controller::new(
        key.clone(),
        controller_config,
        Box::new(SubprocessRunner::default()),
    );

    let clock = SystemClock;
    let started = clock.now_micros();
    let mut passed: u32 = 0;

    let mut runner = EpisodeRunner::new(&mut ledger, &mut controller, key, Ruleset::default());
    let snapshot = warden_core::action::StateSnapshot::new(
        workspace.to_string_lossy().into_owned(),
    );
    let cancel = CancelToken::new();

    for i in 0..episodes {
        let seed = started ^ u64::from(i);
        let arm = sampler
            .select(seed)
            .unwrap_or_else(|| ARMS[0].to_string());
        let episode_id = format!("ep-{started}-{i}");

        let mut proposer = StubProposer;
        let outcome = match runner.run(&snapshot, &mut proposer, &arm, &episode_id, &cancel) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(episode_id = %episode_id, "episode aborted: {e}");
                return EXIT_IO;
            },
        };

        let reward = outcome.tests_passed;
        if reward {
            passed += 1;
        }
        sampler.update(&arm, reward);
        let ts = i64::try_from(clock.now_micros()).unwrap_or(i64::MAX);
        if let Err(e) = store.record(&arm, reward, &episode_id, ts) {
            error!("outcomes: {e}");
            return EXIT_IO;
        }

        info!(
            episode_id = %episode_id,
            arm = %arm,
            allowed = outcome.allowed,
            status = ?outcome.status,
            tests_passed = reward,
            "episode finished"
        );
    }

    println!("episodes: {episodes}  passed: {passed}");
    if let Ok(records) = store.arm_records() {
        for r in records {
            println!(
                "  {:<18} pulls {:>4}  wins {:>4}  win-rate {:.2}",
                r.arm_id, r.pulls, r.wins, r.win_rate
            );
        }
    }
    EXIT_OK
}
