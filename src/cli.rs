//! Command line surface of the `realmload` binary.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    api::Credentials,
    config::{EngineConfig, RealmStrategy, ThinkTime},
    error::{ConfigError, ProfileError},
    scenario::{ScenarioProfile, parse_duration},
};

#[derive(Debug, Parser)]
#[command(name = "realmload", version)]
#[command(about = "Virtual-user load generator for identity-management admin APIs")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one scenario
    Run(RunArgs),
    /// Run every named scenario in order, lightest first
    All {
        /// Pause between two scenarios
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        cooldown: Duration,
    },
    /// Print the named scenarios
    List,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// light, medium, heavy, stress or custom
    pub scenario: String,

    #[arg(long)]
    pub users: Option<usize>,

    /// Virtual users started per second
    #[arg(long)]
    pub spawn_rate: Option<f64>,

    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,
}

impl RunArgs {
    /// Resolves the named profile with the overrides applied on top.
    pub fn profile(&self) -> Result<ScenarioProfile, ProfileError> {
        if self.scenario == "custom" {
            let (Some(users), Some(spawn_rate), Some(duration)) =
                (self.users, self.spawn_rate, self.duration)
            else {
                return Err(ProfileError::IncompleteCustom);
            };
            return ScenarioProfile::new("custom", users, spawn_rate, duration);
        }
        ScenarioProfile::named(&self.scenario)?.with_overrides(
            self.users,
            self.spawn_rate,
            self.duration,
        )
    }
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Base URL of the identity server
    #[arg(long, global = true, env = "REALMLOAD_BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Realm owning the admin account
    #[arg(long, global = true, default_value = "master")]
    pub admin_realm: String,

    #[arg(long, global = true, default_value = "admin-cli")]
    pub client_id: String,

    #[arg(long, global = true, env = "REALMLOAD_USERNAME", default_value = "admin")]
    pub username: String,

    #[arg(
        long,
        global = true,
        env = "REALMLOAD_PASSWORD",
        default_value = "admin",
        hide_env_values = true
    )]
    pub password: String,

    /// Work in this existing realm instead of a throw-away one per run
    #[arg(long, global = true)]
    pub realm: Option<String>,

    /// Directory receiving CSV and summary artifacts
    #[arg(long, global = true, default_value = "test_results")]
    pub results_dir: PathBuf,

    #[arg(long, global = true, default_value = "2s", value_parser = parse_duration)]
    pub think_min: Duration,

    #[arg(long, global = true, default_value = "5s", value_parser = parse_duration)]
    pub think_max: Duration,

    #[arg(long, global = true, default_value = "4m", value_parser = parse_duration)]
    pub refresh_interval: Duration,

    #[arg(long, global = true, default_value = "30s", value_parser = parse_duration)]
    pub request_timeout: Duration,

    /// Reachability probes before a run gives up
    #[arg(long, global = true, default_value_t = 30)]
    pub readiness_attempts: u32,

    #[arg(long, global = true, default_value = "10s", value_parser = parse_duration)]
    pub readiness_interval: Duration,

    /// Seed for reproducible task selection
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = EngineConfig::builder()
            .base_url(self.base_url.clone())
            .credentials(Credentials {
                admin_realm: self.admin_realm.clone(),
                client_id: self.client_id.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            })
            .realm(match &self.realm {
                Some(name) => RealmStrategy::Fixed(name.clone()),
                None => RealmStrategy::Isolated,
            })
            .think_time(ThinkTime::new(self.think_min, self.think_max)?)
            .refresh_interval(self.refresh_interval)
            .request_timeout(self.request_timeout)
            .readiness_attempts(self.readiness_attempts)
            .readiness_interval(self.readiness_interval)
            .build();
        config.seed = self.seed;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("realmload").chain(args.iter().copied())).unwrap()
    }

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn named_scenario_with_overrides() {
        let profile = run_args(parse(&["run", "light", "--users", "5", "--duration", "1m"]))
            .profile()
            .unwrap();
        assert_eq!(profile.name(), "light");
        assert_eq!(profile.virtual_user_count(), 5);
        assert_eq!(profile.spawn_rate(), 2.0);
        assert_eq!(profile.duration(), Duration::from_secs(60));
    }

    #[test]
    fn custom_needs_every_parameter() {
        let args = run_args(parse(&["run", "custom", "--users", "5", "--spawn-rate", "1"]));
        assert_eq!(args.profile(), Err(ProfileError::IncompleteCustom));

        let profile = run_args(parse(&[
            "run",
            "custom",
            "--users",
            "5",
            "--spawn-rate",
            "0.5",
            "--duration",
            "1m30s",
        ]))
        .profile()
        .unwrap();
        assert_eq!(profile.name(), "custom");
        assert_eq!(profile.duration(), Duration::from_secs(90));
    }

    #[test]
    fn unknown_scenario_is_rejected() {
        let args = run_args(parse(&["run", "extreme"]));
        assert_eq!(
            args.profile(),
            Err(ProfileError::UnknownScenario("extreme".into()))
        );
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let res = Cli::try_parse_from(["realmload", "run", "light", "--duration", "5x"]);
        assert!(res.is_err());
    }

    #[test]
    fn all_defaults_to_thirty_second_cooldown() {
        match parse(&["all"]).command {
            Command::All { cooldown } => assert_eq!(cooldown, Duration::from_secs(30)),
            other => panic!("expected all, got {other:?}"),
        }
        match parse(&["all", "--cooldown", "0"]).command {
            Command::All { cooldown } => assert!(cooldown.is_zero()),
            other => panic!("expected all, got {other:?}"),
        }
    }

    #[test]
    fn global_options_build_the_engine_config() {
        let cli = parse(&[
            "list",
            "--realm",
            "perf",
            "--think-min",
            "1s",
            "--think-max",
            "1s",
            "--seed",
            "9",
            "--readiness-attempts",
            "3",
        ]);
        let config = cli.global.engine_config().unwrap();
        assert_eq!(config.realm, RealmStrategy::Fixed("perf".into()));
        assert_eq!(config.think_time.min(), Duration::from_secs(1));
        assert_eq!(config.seed, Some(9));
        assert_eq!(config.readiness_attempts, 3);
        assert_eq!(config.refresh_interval, Duration::from_secs(240));
    }

    #[test]
    fn inverted_think_time_is_rejected() {
        let cli = parse(&["list", "--think-min", "5s", "--think-max", "2s"]);
        assert!(matches!(
            cli.global.engine_config(),
            Err(ConfigError::InvalidThinkTime { .. })
        ));
    }
}
