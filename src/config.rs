//! 配置模块
//! 命令行/环境变量选项，以及启动时校验一次的不可变负载配置

use crate::error::{AppError, Result};
use crate::store::memory::MemoryStoreOptions;
use clap::Parser;
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

/// 默认值
pub mod defaults {
    pub const TABLE_NAME: &str = "Log";
    pub const KEY_PREFIX: &str = "rloc:";
    pub const KEY_WIDTH: usize = 20;
    pub const NUMBER_OF_KEYS: u64 = 1_000_000;
    pub const PAYLOAD_MIN_CHARS: usize = 15;
    pub const PAYLOAD_MAX_CHARS: usize = 15;
    pub const ZIPF_SHAPE: f64 = 1.01;
    pub const ZIPF_DIRECTION: i64 = 1;
    pub const ZIPF_MAX_KEYS: u64 = 10_000_000;
    pub const ZIPF_OFFSET: i64 = 0;
    pub const RETENTION_SECS: u64 = 300;
    pub const BATCH_SIZE: usize = 100;
    pub const COUNT_WINDOW_SECS: u64 = 150;
    pub const JUMBO_FREQUENCY: i64 = 50;
    pub const JUMBO_INITIAL_EXCLUDE: u64 = 100;
    pub const JUMBO_SIZES: &str = "25,25,50,100,1000";
    pub const LOCAL_ENDPOINT: &str = "http://localhost:8000";

    /// 单次采样允许的最大拒绝次数
    pub const MAX_SAMPLE_ATTEMPTS: u32 = 10_000;

    pub const USERS: usize = 10;
    pub const THREADS: usize = 1;
    pub const PAGE_SIZE: usize = 1000;
}

/// 错误消息常量
pub mod messages {
    pub const RUNTIME_CREATE_FAILED: &str = "Failed to create Compio runtime";
    pub const CONFIG_INVALID: &str = "Invalid workload configuration";
    pub const ENSURE_TABLE_FAILED: &str = "Failed to ensure table";
    pub const SMOKE_FAILED: &str = "Smoke check failed";
    pub const RUN_FAILED: &str = "Workload run failed";
}

/// 原始命令行选项，所有字段都可由环境变量提供
#[derive(Parser, Debug, Clone)]
#[command(
    name = "kv-workload",
    version,
    about = "Skewed load generator for composite-key stores"
)]
pub struct Options {
    /// Table name
    #[arg(
        long,
        env = "KV_WORKLOAD_TABLE_NAME",
        default_value = defaults::TABLE_NAME
    )]
    pub table_name: String,

    /// Prefix for key names
    #[arg(
        long,
        env = "KV_WORKLOAD_KEY_PREFIX",
        default_value = defaults::KEY_PREFIX
    )]
    pub key_prefix: String,

    /// Digits of the key name, not including the prefix
    #[arg(
        long,
        env = "KV_WORKLOAD_KEY_WIDTH",
        default_value_t = defaults::KEY_WIDTH
    )]
    pub key_width: usize,

    /// Size of the key space (reported only; sampling is bounded by --zipf-max-keys)
    #[arg(
        long,
        env = "KV_WORKLOAD_NUM_OF_KEYS",
        default_value_t = defaults::NUMBER_OF_KEYS
    )]
    pub number_of_keys: u64,

    /// Minimum payload characters
    #[arg(
        long,
        env = "KV_WORKLOAD_VALUE_MIN_CHARS",
        default_value_t = defaults::PAYLOAD_MIN_CHARS
    )]
    pub value_min_chars: usize,

    /// Maximum payload characters
    #[arg(
        long,
        env = "KV_WORKLOAD_VALUE_MAX_CHARS",
        default_value_t = defaults::PAYLOAD_MAX_CHARS
    )]
    pub value_max_chars: usize,

    /// Zipf shape, must be > 1
    #[arg(
        long,
        env = "KV_WORKLOAD_ZIPF_SHAPE",
        default_value_t = defaults::ZIPF_SHAPE
    )]
    pub zipf_shape: f64,

    /// Zipf direction [1|-1]
    #[arg(
        long,
        env = "KV_WORKLOAD_ZIPF_DIRECTION",
        default_value_t = defaults::ZIPF_DIRECTION,
        allow_negative_numbers = true
    )]
    pub zipf_direction: i64,

    /// Largest accepted zipf draw
    #[arg(
        long,
        env = "KV_WORKLOAD_ZIPF_MAX_KEYS",
        default_value_t = defaults::ZIPF_MAX_KEYS
    )]
    pub zipf_max_keys: u64,

    /// Offset added to every (directed) draw
    #[arg(
        long,
        env = "KV_WORKLOAD_ZIPF_OFFSET",
        default_value_t = defaults::ZIPF_OFFSET,
        allow_negative_numbers = true
    )]
    pub zipf_offset: i64,

    /// Seconds to keep when trimming, 0 disables trimming
    #[arg(
        long,
        env = "KV_WORKLOAD_RETENTION_SECONDS",
        default_value_t = defaults::RETENTION_SECS
    )]
    pub retention_seconds: u64,

    /// Keys per batch operation
    #[arg(
        long,
        env = "KV_WORKLOAD_BATCH_SIZE",
        default_value_t = defaults::BATCH_SIZE
    )]
    pub batch_size: usize,

    /// Seconds covered by a count query
    #[arg(
        long,
        env = "KV_WORKLOAD_COUNT_SECONDS",
        default_value_t = defaults::COUNT_WINDOW_SECS
    )]
    pub count_seconds: u64,

    /// Every transformed index divisible by this triggers a jumbo add
    #[arg(
        long,
        env = "KV_WORKLOAD_JUMBO_FREQUENCY",
        default_value_t = defaults::JUMBO_FREQUENCY
    )]
    pub jumbo_frequency: i64,

    /// Raw indices up to this value never trigger a jumbo add
    #[arg(
        long,
        env = "KV_WORKLOAD_JUMBO_INITIAL_EXCLUDE",
        default_value_t = defaults::JUMBO_INITIAL_EXCLUDE
    )]
    pub jumbo_initial_exclude: u64,

    /// Comma separated extra item counts for jumbo adds
    #[arg(
        long,
        env = "KV_WORKLOAD_JUMBO_SIZE",
        default_value = defaults::JUMBO_SIZES
    )]
    pub jumbo_size: String,

    /// Use the local store endpoint [Y|N]
    #[arg(long, env = "KV_WORKLOAD_LOCAL_MODE", default_value = "Y")]
    pub local_mode: String,

    /// Remote endpoint, used when local mode is off
    #[arg(long, env = "KV_WORKLOAD_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Concurrent virtual users
    #[arg(long, env = "KV_WORKLOAD_USERS", default_value_t = defaults::USERS)]
    pub users: usize,

    /// Worker threads the users are spread over
    #[arg(long, env = "KV_WORKLOAD_THREADS", default_value_t = defaults::THREADS)]
    pub threads: usize,

    /// Stop after this many seconds
    #[arg(long, env = "KV_WORKLOAD_RUN_SECONDS")]
    pub run_seconds: Option<u64>,

    /// Stop each user after this many operations
    #[arg(long, env = "KV_WORKLOAD_ITERATIONS")]
    pub iterations: Option<u64>,

    /// Seed for reproducible key and payload streams
    #[arg(long, env = "KV_WORKLOAD_SEED")]
    pub seed: Option<u64>,

    /// Relative weight of the add task
    #[arg(long, env = "KV_WORKLOAD_ADD_WEIGHT", default_value_t = 1)]
    pub add_weight: u32,

    /// Relative weight of the batch add task
    #[arg(long, env = "KV_WORKLOAD_ADD_BATCH_WEIGHT", default_value_t = 1)]
    pub add_batch_weight: u32,

    /// Relative weight of the count task
    #[arg(long, env = "KV_WORKLOAD_COUNT_WEIGHT", default_value_t = 1)]
    pub count_weight: u32,

    /// Items per page returned by the in-memory store
    #[arg(
        long,
        env = "KV_WORKLOAD_PAGE_SIZE",
        default_value_t = defaults::PAGE_SIZE
    )]
    pub page_size: usize,

    /// Minimum simulated store latency in microseconds
    #[arg(long, env = "KV_WORKLOAD_MIN_LATENCY_US", default_value_t = 0)]
    pub min_latency_us: u64,

    /// Maximum simulated store latency in microseconds
    #[arg(long, env = "KV_WORKLOAD_MAX_LATENCY_US", default_value_t = 0)]
    pub max_latency_us: u64,

    /// Run the single-page smoke check before the load
    #[arg(long)]
    pub smoke: bool,

    /// Print the summary as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// 目标存储位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Local { endpoint: String },
    Remote { endpoint: Option<String> },
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTarget::Local { endpoint } => write!(f, "local ({endpoint})"),
            StoreTarget::Remote { endpoint } => match endpoint {
                Some(endpoint) => write!(f, "remote ({endpoint})"),
                None => write!(f, "remote (default endpoint)"),
            },
        }
    }
}

/// Zipf 参数
#[derive(Debug, Clone, PartialEq)]
pub struct ZipfConfig {
    pub shape: f64,
    pub direction: i64,
    pub max_keys: u64,
    pub offset: i64,
}

impl ZipfConfig {
    /// 原始索引 -> 变换后索引
    #[inline]
    pub fn transform(&self, raw: u64) -> i64 {
        self.offset + self.direction * raw as i64
    }

    /// 变换后索引可能出现的最大位数（含符号）
    pub fn max_digits(&self) -> usize {
        let lo = self.transform(1);
        let hi = self.transform(self.max_keys);
        digit_count(lo).max(digit_count(hi))
    }
}

/// Jumbo 参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumboConfig {
    pub frequency: i64,
    pub initial_exclude: u64,
    pub sizes: Vec<usize>,
}

/// 校验后的负载配置，启动后只读
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    pub table_name: String,
    pub key_prefix: String,
    pub key_width: usize,
    pub number_of_keys: u64,
    pub payload_chars: RangeInclusive<usize>,
    pub zipf: ZipfConfig,
    pub retention_secs: u64,
    pub batch_size: usize,
    pub count_window_secs: u64,
    pub jumbo: JumboConfig,
    pub target: StoreTarget,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            table_name: defaults::TABLE_NAME.to_string(),
            key_prefix: defaults::KEY_PREFIX.to_string(),
            key_width: defaults::KEY_WIDTH,
            number_of_keys: defaults::NUMBER_OF_KEYS,
            payload_chars: defaults::PAYLOAD_MIN_CHARS..=defaults::PAYLOAD_MAX_CHARS,
            zipf: ZipfConfig {
                shape: defaults::ZIPF_SHAPE,
                direction: defaults::ZIPF_DIRECTION,
                max_keys: defaults::ZIPF_MAX_KEYS,
                offset: defaults::ZIPF_OFFSET,
            },
            retention_secs: defaults::RETENTION_SECS,
            batch_size: defaults::BATCH_SIZE,
            count_window_secs: defaults::COUNT_WINDOW_SECS,
            jumbo: JumboConfig {
                frequency: defaults::JUMBO_FREQUENCY,
                initial_exclude: defaults::JUMBO_INITIAL_EXCLUDE,
                sizes: vec![25, 25, 50, 100, 1000],
            },
            target: StoreTarget::Local {
                endpoint: defaults::LOCAL_ENDPOINT.to_string(),
            },
        }
    }
}

impl WorkloadConfig {
    /// 校验全部参数，任何错误都是启动期致命错误
    pub fn validate(&self) -> Result<()> {
        let zipf = &self.zipf;
        if !zipf.shape.is_finite() || zipf.shape <= 1.0 {
            return Err(AppError::Config(format!(
                "zipf shape must be a finite value > 1, got {}",
                zipf.shape
            )));
        }
        if zipf.direction != 1 && zipf.direction != -1 {
            return Err(AppError::Config(format!(
                "zipf direction must be 1 or -1, got {}",
                zipf.direction
            )));
        }
        if zipf.max_keys == 0 || zipf.max_keys > i64::MAX as u64 {
            return Err(AppError::Config(format!(
                "zipf max keys out of range: {}",
                zipf.max_keys
            )));
        }
        let span = zipf.direction.saturating_mul(zipf.max_keys as i64);
        if zipf.offset.checked_add(span).is_none() {
            return Err(AppError::Config(
                "zipf offset overflows the key space".into(),
            ));
        }
        if self.number_of_keys == 0 {
            return Err(AppError::Config("number of keys must be positive".into()));
        }
        let needed = zipf.max_digits();
        if self.key_width < needed {
            return Err(AppError::Config(format!(
                "key width {} cannot hold transformed indices of {} digits",
                self.key_width, needed
            )));
        }
        let (min, max) = (*self.payload_chars.start(), *self.payload_chars.end());
        if max == 0 || min > max {
            return Err(AppError::Config(format!(
                "payload length bounds invalid: min {min}, max {max}"
            )));
        }
        if self.batch_size == 0 {
            return Err(AppError::Config("batch size must be at least 1".into()));
        }
        if self.jumbo.frequency < 1 {
            return Err(AppError::Config(format!(
                "jumbo frequency must be at least 1, got {}",
                self.jumbo.frequency
            )));
        }
        if self.jumbo.sizes.is_empty() {
            return Err(AppError::Config("jumbo size menu is empty".into()));
        }
        Ok(())
    }
}

/// 三类任务的相对权重
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMix {
    pub add: u32,
    pub add_batch: u32,
    pub count: u32,
}

impl Default for TaskMix {
    fn default() -> Self {
        Self {
            add: 1,
            add_batch: 1,
            count: 1,
        }
    }
}

/// 运行参数
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub users: usize,
    pub threads: usize,
    pub duration: Option<Duration>,
    pub iterations: Option<u64>,
    pub seed: Option<u64>,
    pub mix: TaskMix,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            users: defaults::USERS,
            threads: defaults::THREADS,
            duration: None,
            iterations: None,
            seed: None,
            mix: TaskMix::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.users == 0 {
            return Err(AppError::Config(
                "at least one virtual user is required".into(),
            ));
        }
        if self.threads == 0 {
            return Err(AppError::Config(
                "at least one worker thread is required".into(),
            ));
        }
        let mix = self.mix;
        if mix.add == 0 && mix.add_batch == 0 && mix.count == 0 {
            return Err(AppError::Config("all task weights are zero".into()));
        }
        Ok(())
    }
}

impl Options {
    /// 构建并校验负载配置
    pub fn workload_config(&self) -> Result<WorkloadConfig> {
        let target = if parse_flag(&self.local_mode)? {
            StoreTarget::Local {
                endpoint: defaults::LOCAL_ENDPOINT.to_string(),
            }
        } else {
            StoreTarget::Remote {
                endpoint: self.endpoint.clone(),
            }
        };
        let config = WorkloadConfig {
            table_name: self.table_name.clone(),
            key_prefix: self.key_prefix.clone(),
            key_width: self.key_width,
            number_of_keys: self.number_of_keys,
            payload_chars: self.value_min_chars..=self.value_max_chars,
            zipf: ZipfConfig {
                shape: self.zipf_shape,
                direction: self.zipf_direction,
                max_keys: self.zipf_max_keys,
                offset: self.zipf_offset,
            },
            retention_secs: self.retention_seconds,
            batch_size: self.batch_size,
            count_window_secs: self.count_seconds,
            jumbo: JumboConfig {
                frequency: self.jumbo_frequency,
                initial_exclude: self.jumbo_initial_exclude,
                sizes: parse_jumbo_sizes(&self.jumbo_size)?,
            },
            target,
        };
        config.validate()?;
        Ok(config)
    }

    /// 构建并校验运行参数
    pub fn run_config(&self) -> Result<RunConfig> {
        let config = RunConfig {
            users: self.users,
            threads: self.threads,
            duration: self.run_seconds.map(Duration::from_secs),
            iterations: self.iterations,
            seed: self.seed,
            mix: TaskMix {
                add: self.add_weight,
                add_batch: self.add_batch_weight,
                count: self.count_weight,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// 内存存储参数
    pub fn memory_store_options(&self) -> Result<MemoryStoreOptions> {
        if self.page_size == 0 {
            return Err(AppError::Config("page size must be at least 1".into()));
        }
        if self.min_latency_us > self.max_latency_us {
            return Err(AppError::Config(format!(
                "simulated latency bounds invalid: min {}us, max {}us",
                self.min_latency_us, self.max_latency_us
            )));
        }
        Ok(MemoryStoreOptions {
            page_size: self.page_size,
            latency: Duration::from_micros(self.min_latency_us)
                ..=Duration::from_micros(self.max_latency_us),
        })
    }
}

/// 解析逗号分隔的 jumbo 大小列表，例如 "25,25,50,100,1000"
pub fn parse_jumbo_sizes(menu: &str) -> Result<Vec<usize>> {
    let sizes = menu
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<usize>()
                .map_err(|e| AppError::Config(format!("jumbo size {part:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    if sizes.is_empty() {
        return Err(AppError::Config("jumbo size menu is empty".into()));
    }
    Ok(sizes)
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_uppercase().as_str() {
        "Y" | "YES" | "TRUE" | "1" => Ok(true),
        "N" | "NO" | "FALSE" | "0" => Ok(false),
        other => Err(AppError::Config(format!("expected Y or N, got {other:?}"))),
    }
}

/// 十进制位数，负数额外计一位符号
fn digit_count(value: i64) -> usize {
    let sign = usize::from(value < 0);
    let mut n = value.unsigned_abs();
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits + sign
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["kv-workload"];
        argv.extend_from_slice(args);
        Options::try_parse_from(argv).expect("options parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = options(&[]).workload_config().unwrap();
        assert_eq!(config, WorkloadConfig::default());
        assert_eq!(config.key_prefix, "rloc:");
        assert_eq!(config.key_width, 20);
        assert_eq!(config.payload_chars, 15..=15);
        assert_eq!(config.zipf.max_keys, 10_000_000);
        assert_eq!(config.jumbo.sizes, vec![25, 25, 50, 100, 1000]);
        assert_eq!(config.retention_secs, 300);
        assert_eq!(config.count_window_secs, 150);
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn jumbo_menu_tolerates_whitespace() {
        assert_eq!(parse_jumbo_sizes(" 1, 2 ,3").unwrap(), vec![1, 2, 3]);
    }

    #[test_case(""; "empty")]
    #[test_case("25,,50"; "hole")]
    #[test_case("25,x"; "not a number")]
    #[test_case("-5"; "negative")]
    fn malformed_jumbo_menu_is_rejected(menu: &str) {
        assert!(parse_jumbo_sizes(menu).unwrap_err().is_config());
    }

    #[test_case(&["--zipf-shape", "1.0"]; "shape at one")]
    #[test_case(&["--zipf-shape", "0"]; "shape zero")]
    #[test_case(&["--zipf-shape", "NaN"]; "shape nan")]
    #[test_case(&["--zipf-direction", "2"]; "direction two")]
    #[test_case(&["--zipf-max-keys", "0"]; "no keys")]
    #[test_case(&["--key-width", "7"]; "width too small")]
    #[test_case(&["--value-min-chars", "16"]; "min above max")]
    #[test_case(&["--batch-size", "0"]; "empty batch")]
    #[test_case(&["--jumbo-frequency", "0"]; "zero frequency")]
    #[test_case(&["--local-mode", "maybe"]; "bad flag")]
    fn invalid_workload_options_fail_fast(args: &[&str]) {
        let err = options(args).workload_config().unwrap_err();
        assert!(err.is_config(), "{err}");
    }

    #[test]
    fn width_accounts_for_sign_of_negative_direction() {
        // offset 0, direction -1, max 999 -> "-999" needs 4 columns
        let narrow = |width: &'static str| {
            let mut args = vec!["--zipf-direction", "-1", "--zipf-max-keys", "999"];
            args.extend(["--key-width", width]);
            options(&args)
        };
        assert!(narrow("4").workload_config().is_ok());
        assert!(narrow("3").workload_config().is_err());
    }

    #[test]
    fn remote_mode_keeps_endpoint() {
        let config = options(&["--local-mode", "N", "--endpoint", "http://db:8000"])
            .workload_config()
            .unwrap();
        assert_eq!(
            config.target,
            StoreTarget::Remote {
                endpoint: Some("http://db:8000".into())
            }
        );
    }

    #[test]
    fn run_config_rejects_zero_users_and_weights() {
        assert!(options(&["--users", "0"]).run_config().is_err());
        assert!(options(&["--threads", "0"]).run_config().is_err());
        let no_weights = [
            "--add-weight",
            "0",
            "--add-batch-weight",
            "0",
            "--count-weight",
            "0",
        ];
        assert!(options(&no_weights).run_config().is_err());
        let run = options(&["--run-seconds", "5", "--seed", "7"]).run_config().unwrap();
        assert_eq!(run.duration, Some(Duration::from_secs(5)));
        assert_eq!(run.seed, Some(7));
    }

    #[test]
    fn memory_store_latency_bounds_checked() {
        let inverted = options(&["--min-latency-us", "10", "--max-latency-us", "5"]);
        assert!(inverted.memory_store_options().is_err());
        let no_page = options(&["--page-size", "0"]);
        assert!(no_page.memory_store_options().is_err());
    }

    #[test_case(0, 1)]
    #[test_case(9, 1)]
    #[test_case(10, 2)]
    #[test_case(-5, 2)]
    #[test_case(10_000_000, 8)]
    fn digit_count_includes_sign(value: i64, digits: usize) {
        assert_eq!(digit_count(value), digits);
    }
}
