use crate::error::CliError;
use crate::format::{DEFAULT_TEMPLATE, TEMPLATE_HELP};
use crate::protocol::Offset;
use clap::Args;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CLIENT_ID: &str = "kafka-cli";
pub const DEFAULT_CONFIG_FILE: &str = ".kafka-cli.json";
pub const ENV_PREFIX: &str = "KAFKA_CLI_";

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// config file (default is $HOME/.kafka-cli.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// broker list, delimited by comma
    #[arg(long, global = true, default_value = "127.0.0.1:9092")]
    pub brokers: String,

    /// zookeeper server list, delimited by comma, only use when operate topic
    #[arg(long, global = true, default_value = "127.0.0.1:9093")]
    pub zookeepers: String,

    /// timeout of dialing to brokers
    #[arg(long = "net.dialtimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub dial_timeout: Duration,

    /// timeout of reading messages
    #[arg(long = "net.readtimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// timeout of writing messages
    #[arg(long = "net.writetimeout", global = true, default_value = "30s", value_parser = humantime::parse_duration)]
    pub write_timeout: Duration,

    /// how many outstanding requests a connection is allowed to have before sending on it blocks
    #[arg(long = "net.maxopenrequests", global = true, default_value_t = 5)]
    pub max_open_requests: u32,

    /// keepalive period, 0 means disabled
    #[arg(long = "net.keepalive", global = true, default_value = "0s", value_parser = humantime::parse_duration)]
    pub keepalive: Duration,

    /// internal channel buffer size
    #[arg(long = "buffersize", global = true, default_value_t = 256)]
    pub buffer_size: usize,

    /// a user-provided string sent with every request to the brokers for logging,
    /// debugging, and auditing purposes [default: kafka-cli]
    #[arg(long = "clientid", global = true)]
    pub client_id: Option<String>,

    /// metadata refresh frequency
    #[arg(long = "metadata.refresh", global = true, default_value = "10m", value_parser = humantime::parse_duration)]
    pub metadata_refresh: Duration,

    /// total number to request metadata when the cluster has a leader election
    #[arg(long = "metadata.retry.max", global = true, default_value_t = 3)]
    pub metadata_retry_max: u32,

    /// backoff between retrying
    #[arg(long = "metadata.retry.backoff", global = true, default_value = "250ms", value_parser = humantime::parse_duration)]
    pub metadata_retry_backoff: Duration,

    /// print log messages
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// log authentication messages
    #[arg(long = "log-auth-msg", global = true)]
    pub log_auth_msg: bool,
}

/// Fetch and offset tuning handed to the consumer as-is.
#[derive(Debug, Clone, Args)]
pub struct ConsumerTuning {
    /// the maximum amount of time the broker will wait for fetch.min bytes to become available
    #[arg(long = "maxwaittime", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub max_wait_time: Duration,

    /// the maximum amount of time the consumer expects a message takes to process for the user
    #[arg(long = "maxprocessingtime", default_value = "100ms", value_parser = humantime::parse_duration)]
    pub max_processing_time: Duration,

    /// how long to wait after a failing to read from a partition before trying again
    #[arg(long = "retry.backoff", default_value = "2s", value_parser = humantime::parse_duration)]
    pub retry_backoff: Duration,

    /// the minimum number of message bytes to fetch in a request
    #[arg(long = "fetch.min", default_value_t = 1)]
    pub fetch_min: i32,

    /// the default number of message bytes to fetch from the broker in each request
    #[arg(long = "fetch.default", default_value_t = 32768)]
    pub fetch_default: i32,

    /// the maximum number of message bytes to fetch from the broker in a single request, 0 means no limit
    #[arg(long = "fetch.max", default_value_t = 0)]
    pub fetch_max: i32,

    /// how frequently to commit updated offsets
    #[arg(long = "offsets.commitinterval", default_value = "1s", value_parser = humantime::parse_duration)]
    pub commit_interval: Duration,

    /// the initial offset to use if no offset was previously committed
    #[arg(long = "offsets.initial", default_value = "-1", allow_negative_numbers = true, value_parser = parse_offset)]
    pub initial_offset: Offset,

    /// any errors that occurred while consuming are returned
    #[arg(long = "return.errors", default_value_t = true, action = clap::ArgAction::Set)]
    pub return_errors: bool,
}

impl ConsumerTuning {
    pub fn auto_offset_reset(&self) -> Result<&'static str, CliError> {
        match self.initial_offset {
            Offset::Newest => Ok("latest"),
            Offset::Oldest => Ok("earliest"),
            Offset::At(n) => Err(CliError::Usage(format!(
                "offsets.initial must be newest(-1) or oldest(-2), got {}",
                n
            ))),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ConsumeArgs {
    /// topics to consume
    pub topics: Vec<String>,

    /// partition to consume, negative means all partitions
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub partition: i32,

    /// offset to consume (newest=-1, oldest=-2)
    #[arg(long, default_value = "-1", allow_negative_numbers = true, value_parser = parse_offset)]
    pub offset: Offset,

    /// the format of output
    #[arg(long, default_value = DEFAULT_TEMPLATE, long_help = TEMPLATE_HELP)]
    pub format: String,

    #[command(flatten)]
    pub tuning: ConsumerTuning,
}

#[derive(Debug, Clone, Args)]
pub struct ProduceArgs {
    /// topic to send to
    pub topic: String,

    /// file whose contents become the message value
    pub file: PathBuf,

    /// optional message key
    pub key: Option<String>,

    /// the level of acknowledgement reliability needed from the broker
    #[arg(long = "request.required.acks", default_value_t = 1, allow_negative_numbers = true)]
    pub required_acks: i16,
}

/// Values that may come from the settings file.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct FileConfig {
    #[serde(alias = "USER")]
    pub user: Option<String>,
    #[serde(alias = "PASSWORD")]
    pub password: Option<String>,
    #[serde(alias = "CLIENT_ID")]
    pub client_id: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let data = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        let config: FileConfig = serde_json::from_str(&data)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Resolved connection settings: flags, then environment, then settings file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub brokers: Vec<String>,
    pub zookeepers: Vec<String>,
    pub dial_timeout: Duration,
    /// Larger of the read and write timeouts; the client has a single socket timeout.
    pub socket_timeout: Duration,
    pub max_open_requests: u32,
    pub keepalive: Duration,
    pub buffer_size: usize,
    pub client_id: String,
    pub metadata_refresh: Duration,
    pub metadata_retry_max: u32,
    pub metadata_retry_backoff: Duration,
    pub verbose: bool,
    pub credentials: Option<Credentials>,
    pub consumer: Option<ConsumerTuning>,
    pub config_file: Option<PathBuf>,
}

impl Settings {
    pub fn load(args: &ConnectionArgs, consumer: Option<ConsumerTuning>) -> Result<Self, CliError> {
        let settings = Self::resolve(args, consumer, |key| env::var(key).ok())?;
        if let Some(path) = &settings.config_file {
            println!("Using config file: {}", path.display());
        }
        Ok(settings)
    }

    pub fn resolve<F>(
        args: &ConnectionArgs,
        consumer: Option<ConsumerTuning>,
        lookup: F,
    ) -> Result<Self, CliError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if args.buffer_size == 0 {
            return Err(CliError::Usage("buffersize must be greater than 0".to_string()));
        }
        let brokers = split_list(&args.brokers);
        if brokers.is_empty() {
            return Err(CliError::Usage("at least one broker is required".to_string()));
        }

        let (file, config_file) = match &args.config {
            Some(path) => (FileConfig::from_file(path)?, Some(path.clone())),
            None => match lookup("HOME").map(|home| Path::new(&home).join(DEFAULT_CONFIG_FILE)) {
                Some(path) if path.is_file() => (FileConfig::from_file(&path)?, Some(path)),
                _ => (FileConfig::default(), None),
            },
        };

        let value = |key: &str, from_file: &Option<String>| {
            lookup(&format!("{}{}", ENV_PREFIX, key))
                .or_else(|| from_file.clone())
                .filter(|v| !v.is_empty())
        };

        let credentials = value("USER", &file.user).map(|user| Credentials {
            user,
            password: value("PASSWORD", &file.password).unwrap_or_default(),
        });

        let client_id = args
            .client_id
            .clone()
            .or_else(|| value("CLIENT_ID", &file.client_id))
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        Ok(Self {
            brokers,
            zookeepers: split_list(&args.zookeepers),
            dial_timeout: args.dial_timeout,
            socket_timeout: args.read_timeout.max(args.write_timeout),
            max_open_requests: args.max_open_requests,
            keepalive: args.keepalive,
            buffer_size: args.buffer_size,
            client_id,
            metadata_refresh: args.metadata_refresh,
            metadata_retry_max: args.metadata_retry_max,
            metadata_retry_backoff: args.metadata_retry_backoff,
            verbose: args.verbose,
            credentials,
            consumer,
            config_file,
        })
    }

    /// Line printed by `--log-auth-msg`.
    pub fn auth_log(&self) -> String {
        let (user, password) = match &self.credentials {
            Some(c) => (c.user.as_str(), c.password.as_str()),
            None => ("", ""),
        };
        format!(
            "AuthLog: User: {}, Password: {}, ClientID: {}",
            user, password, self.client_id
        )
    }
}

fn parse_offset(s: &str) -> Result<Offset, String> {
    s.parse().map_err(|e: CliError| e.to_string())
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;
    use std::io::Write;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        connection: ConnectionArgs,
    }

    fn args(extra: &[&str]) -> ConnectionArgs {
        let mut argv = vec!["kafka-cli"];
        argv.extend_from_slice(extra);
        TestCli::parse_from(argv).connection
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env_or_file() {
        let settings = Settings::resolve(&args(&[]), None, env(&[])).unwrap();
        assert_eq!(settings.brokers, vec!["127.0.0.1:9092"]);
        assert_eq!(settings.zookeepers, vec!["127.0.0.1:9093"]);
        assert_eq!(settings.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(settings.buffer_size, 256);
        assert_eq!(settings.dial_timeout, Duration::from_secs(30));
        assert_eq!(settings.metadata_refresh, Duration::from_secs(600));
        assert_eq!(settings.metadata_retry_backoff, Duration::from_millis(250));
        assert!(settings.credentials.is_none());
        assert!(settings.config_file.is_none());
    }

    #[test]
    fn broker_list_is_split_and_trimmed() {
        let settings = Settings::resolve(
            &args(&["--brokers", "a:9092, b:9092,,c:9092"]),
            None,
            env(&[]),
        )
        .unwrap();
        assert_eq!(settings.brokers, vec!["a:9092", "b:9092", "c:9092"]);
    }

    #[test]
    fn socket_timeout_takes_larger_value() {
        let settings = Settings::resolve(
            &args(&["--net.readtimeout", "5s", "--net.writetimeout", "1m"]),
            None,
            env(&[]),
        )
        .unwrap();
        assert_eq!(settings.socket_timeout, Duration::from_secs(60));
    }

    #[test]
    fn zero_buffer_size_rejected() {
        let err = Settings::resolve(&args(&["--buffersize", "0"]), None, env(&[])).unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
    }

    #[test]
    fn env_user_enables_credentials() {
        let settings = Settings::resolve(
            &args(&[]),
            None,
            env(&[("KAFKA_CLI_USER", "admin"), ("KAFKA_CLI_PASSWORD", "secret")]),
        )
        .unwrap();
        assert_eq!(
            settings.credentials,
            Some(Credentials {
                user: "admin".to_string(),
                password: "secret".to_string()
            })
        );
        assert_eq!(
            settings.auth_log(),
            "AuthLog: User: admin, Password: secret, ClientID: kafka-cli"
        );
    }

    #[test]
    fn client_id_flag_beats_env() {
        let lookup = env(&[("KAFKA_CLI_CLIENT_ID", "from-env")]);
        let settings = Settings::resolve(&args(&[]), None, &lookup).unwrap();
        assert_eq!(settings.client_id, "from-env");

        let settings = Settings::resolve(&args(&["--clientid", "from-flag"]), None, &lookup).unwrap();
        assert_eq!(settings.client_id, "from-flag");
    }

    #[test]
    fn explicit_config_file_is_read_and_env_overrides_it() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"user": "file-user", "password": "file-pass", "CLIENT_ID": "file-id"}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let settings =
            Settings::resolve(&args(&["--config", &path]), None, env(&[])).unwrap();
        assert_eq!(settings.client_id, "file-id");
        assert_eq!(settings.credentials.as_ref().unwrap().user, "file-user");
        assert_eq!(settings.config_file.as_deref(), Some(file.path()));

        let settings = Settings::resolve(
            &args(&["--config", &path]),
            None,
            env(&[("KAFKA_CLI_USER", "env-user")]),
        )
        .unwrap();
        let credentials = settings.credentials.unwrap();
        assert_eq!(credentials.user, "env-user");
        assert_eq!(credentials.password, "file-pass");
    }

    #[test]
    fn default_config_file_found_in_home() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join(DEFAULT_CONFIG_FILE), r#"{"client_id": "home-id"}"#).unwrap();
        let home_str = home.path().to_str().unwrap().to_string();

        let settings = Settings::resolve(&args(&[]), None, env(&[("HOME", &home_str)])).unwrap();
        assert_eq!(settings.client_id, "home-id");
        assert!(settings.config_file.is_some());
    }

    #[test]
    fn missing_explicit_config_file_is_fatal() {
        let err = Settings::resolve(
            &args(&["--config", "/definitely/not/here.json"]),
            None,
            env(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials {
            user: "u".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
