use crate::error::{PodwatchError, Result};
use crate::paths;
use crate::types::{BasecallMethod, Basecalling, DuplexPairing, ExperimentRequest, InputType};
use lettre::message::Mailbox;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MODEL: &str = "sup";
pub const DEFAULT_KIT: &str = "SQK-NBD114-24";
pub const DEFAULT_TOOL_BINARY: &str = "dorado";
pub const DEFAULT_INPUT_TYPE_FLAG: &str = "--input-type";
pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Partial (layered) configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialToolConfig {
    pub binary: Option<String>,
    pub extra_args: Option<Vec<String>>,
    /// Flag that carries the input type; an empty string leaves it out.
    pub input_type_flag: Option<String>,
    pub timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialMailConfig {
    pub enabled: Option<bool>,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialIndexConfig {
    pub durable: Option<bool>,
    pub path: Option<PathBuf>,
}

/// One layer of configuration: a YAML file or the command line.
///
/// Layers are combined with [`PartialConfig::merge`] and turned into a
/// validated [`WatchConfig`] by [`PartialConfig::finish`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialConfig {
    pub path: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_stamp")]
    pub date: Option<String>,
    pub basecalling_method: Option<BasecallMethod>,
    pub model: Option<String>,
    pub duplex_pairs: Option<PathBuf>,
    pub kit_name: Option<String>,
    pub input_type: Option<InputType>,
    pub sample_type: Option<String>,
    pub amplification: Option<String>,
    pub email_recipients: Option<Vec<String>>,
    pub queue_capacity: Option<usize>,
    pub tool: PartialToolConfig,
    pub mail: PartialMailConfig,
    pub index: PartialIndexConfig,
}

impl PartialConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            PodwatchError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&data).map_err(|e| {
            PodwatchError::Config(format!("cannot parse config file {}: {e}", path.display()))
        })
    }

    /// Overlay `over` on top of `self`; values set in `over` win.
    pub fn merge(self, over: PartialConfig) -> PartialConfig {
        PartialConfig {
            path: over.path.or(self.path),
            date: over.date.or(self.date),
            basecalling_method: over.basecalling_method.or(self.basecalling_method),
            model: over.model.or(self.model),
            duplex_pairs: over.duplex_pairs.or(self.duplex_pairs),
            kit_name: over.kit_name.or(self.kit_name),
            input_type: over.input_type.or(self.input_type),
            sample_type: over.sample_type.or(self.sample_type),
            amplification: over.amplification.or(self.amplification),
            email_recipients: over.email_recipients.or(self.email_recipients),
            queue_capacity: over.queue_capacity.or(self.queue_capacity),
            tool: PartialToolConfig {
                binary: over.tool.binary.or(self.tool.binary),
                extra_args: over.tool.extra_args.or(self.tool.extra_args),
                input_type_flag: over.tool.input_type_flag.or(self.tool.input_type_flag),
                timeout_minutes: over.tool.timeout_minutes.or(self.tool.timeout_minutes),
            },
            mail: PartialMailConfig {
                enabled: over.mail.enabled.or(self.mail.enabled),
                server: over.mail.server.or(self.mail.server),
                port: over.mail.port.or(self.mail.port),
                from: over.mail.from.or(self.mail.from),
            },
            index: PartialIndexConfig {
                durable: over.index.durable.or(self.index.durable),
                path: over.index.path.or(self.index.path),
            },
        }
    }

    /// Apply defaults and validate. Every problem found is reported at once.
    pub fn finish(self) -> Result<WatchConfig> {
        let mut problems: Vec<String> = Vec::new();

        let root = match self.path {
            None => {
                problems.push("path is required".into());
                None
            }
            Some(p) if !p.is_dir() => {
                problems.push(format!("path {} is not an existing directory", p.display()));
                None
            }
            Some(p) => match std::fs::canonicalize(&p) {
                Ok(abs) => Some(abs),
                Err(e) => {
                    problems.push(format!("cannot resolve path {}: {e}", p.display()));
                    None
                }
            },
        };

        let date = match self.date.as_deref() {
            None => {
                problems.push("date is required (YYYYMMDD)".into());
                None
            }
            Some(stamp) => match paths::parse_date_stamp(stamp) {
                Ok(d) => Some(d),
                Err(e) => {
                    problems.push(error_message(e));
                    None
                }
            },
        };

        let model = self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if model.trim().is_empty() {
            problems.push("model must not be empty".into());
        }
        let kit = self.kit_name.unwrap_or_else(|| DEFAULT_KIT.to_string());
        if kit.trim().is_empty() {
            problems.push("kit_name must not be empty".into());
        }

        let method = self.basecalling_method.unwrap_or(BasecallMethod::Duplex);
        let basecalling = match method {
            BasecallMethod::Simplex => {
                if self.duplex_pairs.is_some() {
                    problems.push("duplex_pairs is only valid with the duplex method".into());
                }
                Basecalling::Simplex { model }
            }
            BasecallMethod::Duplex => {
                let pairing = match self.duplex_pairs {
                    None => DuplexPairing::Auto,
                    Some(path) => {
                        if !path.is_file() {
                            problems.push(format!(
                                "duplex_pairs file {} does not exist",
                                path.display()
                            ));
                        }
                        DuplexPairing::PairsFile { path }
                    }
                };
                Basecalling::Duplex { model, pairing }
            }
        };

        let recipients: Vec<String> = self
            .email_recipients
            .unwrap_or_default()
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if recipients.is_empty() {
            problems.push("at least one email recipient is required".into());
        }
        for r in &recipients {
            if r.parse::<Mailbox>().is_err() {
                problems.push(format!("'{r}' is not a valid email address"));
            }
        }

        let mail = MailConfig {
            enabled: self.mail.enabled.unwrap_or(true),
            server: self
                .mail
                .server
                .unwrap_or_else(|| DEFAULT_SMTP_SERVER.to_string()),
            port: self.mail.port.unwrap_or(DEFAULT_SMTP_PORT),
            from: self.mail.from,
        };
        if let Some(from) = &mail.from {
            if from.parse::<Mailbox>().is_err() {
                problems.push(format!("mail.from '{from}' is not a valid email address"));
            }
        }

        let timeout = match self.tool.timeout_minutes {
            Some(0) => {
                problems.push("tool.timeout_minutes must be greater than zero".into());
                None
            }
            Some(m) => match m.checked_mul(60) {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => {
                    problems.push(format!("tool.timeout_minutes {m} is too large"));
                    None
                }
            },
            None => None,
        };
        let tool = ToolConfig {
            binary: self
                .tool
                .binary
                .unwrap_or_else(|| DEFAULT_TOOL_BINARY.to_string()),
            extra_args: self.tool.extra_args.unwrap_or_default(),
            input_type_flag: match self.tool.input_type_flag {
                None => Some(DEFAULT_INPUT_TYPE_FLAG.to_string()),
                Some(flag) if flag.trim().is_empty() => None,
                Some(flag) => Some(flag),
            },
            timeout,
        };
        if tool.binary.trim().is_empty() {
            problems.push("tool.binary must not be empty".into());
        }

        let queue_capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            problems.push("queue_capacity must be greater than zero".into());
        }

        let (Some(root), Some(date)) = (root, date) else {
            return Err(PodwatchError::Config(problems.join("; ")));
        };
        if !problems.is_empty() {
            return Err(PodwatchError::Config(problems.join("; ")));
        }

        let index = if self.index.durable.unwrap_or(true) {
            IndexConfig::Durable {
                path: self
                    .index
                    .path
                    .unwrap_or_else(|| paths::default_index_path(&root)),
            }
        } else {
            IndexConfig::InMemory
        };

        Ok(WatchConfig {
            request: ExperimentRequest {
                root,
                date,
                basecalling,
                kit,
                input_type: self.input_type.unwrap_or(InputType::Pod5),
                sample_type: self.sample_type,
                amplification: self.amplification,
                recipients,
            },
            tool,
            mail,
            index,
            queue_capacity,
        })
    }
}

/// Accept `date: 20240401` as well as `date: "20240401"`.
fn deserialize_stamp<'de, D>(d: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Stamp {
        Text(String),
        Number(u64),
    }
    Ok(Option::<Stamp>::deserialize(d)?.map(|s| match s {
        Stamp::Text(t) => t,
        Stamp::Number(n) => n.to_string(),
    }))
}

fn error_message(e: PodwatchError) -> String {
    match e {
        PodwatchError::Config(msg) => msg,
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type_flag: Option<String>,
    #[serde(rename = "timeout_secs", serialize_with = "serialize_duration_opt")]
    pub timeout: Option<Duration>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_TOOL_BINARY.to_string(),
            extra_args: Vec::new(),
            input_type_flag: Some(DEFAULT_INPUT_TYPE_FLAG.to_string()),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MailConfig {
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexConfig {
    Durable { path: PathBuf },
    InMemory,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchConfig {
    pub request: ExperimentRequest,
    pub tool: ToolConfig,
    pub mail: MailConfig,
    pub index: IndexConfig,
    pub queue_capacity: usize,
}

fn serialize_duration_opt<S>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(dur) => s.serialize_some(&dur.as_secs()),
        None => s.serialize_none(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn minimal(root: &Path) -> PartialConfig {
        PartialConfig {
            path: Some(root.to_path_buf()),
            date: Some("20240401".into()),
            email_recipients: Some(vec!["lab@example.org".into()]),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_in() {
        let dir = TempDir::new().unwrap();
        let cfg = minimal(dir.path()).finish().unwrap();
        assert_eq!(cfg.request.date, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        assert_eq!(
            cfg.request.basecalling,
            Basecalling::Duplex {
                model: "sup".into(),
                pairing: DuplexPairing::Auto
            }
        );
        assert_eq!(cfg.request.kit, DEFAULT_KIT);
        assert_eq!(cfg.request.input_type, InputType::Pod5);
        assert_eq!(cfg.tool.binary, "dorado");
        assert_eq!(cfg.tool.input_type_flag.as_deref(), Some("--input-type"));
        assert!(cfg.tool.timeout.is_none());
        assert_eq!(cfg.mail.port, 587);
        assert_eq!(cfg.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(
            cfg.index,
            IndexConfig::Durable {
                path: root.join(".podwatch/markers.redb")
            }
        );
    }

    #[test]
    fn later_layer_wins() {
        let dir = TempDir::new().unwrap();
        let file = PartialConfig {
            model: Some("hac".into()),
            kit_name: Some("SQK-LSK114".into()),
            ..minimal(dir.path())
        };
        let cli = PartialConfig {
            model: Some("fast".into()),
            basecalling_method: Some(BasecallMethod::Simplex),
            ..Default::default()
        };
        let cfg = file.merge(cli).finish().unwrap();
        assert_eq!(
            cfg.request.basecalling,
            Basecalling::Simplex {
                model: "fast".into()
            }
        );
        assert_eq!(cfg.request.kit, "SQK-LSK114");
    }

    #[test]
    fn missing_required_fields_are_all_reported() {
        let err = PartialConfig::default().finish().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("path is required"), "{msg}");
        assert!(msg.contains("date is required"), "{msg}");
        assert!(msg.contains("recipient"), "{msg}");
    }

    #[test]
    fn rejects_bad_values() {
        let dir = TempDir::new().unwrap();
        let cases: Vec<(PartialConfig, &str)> = vec![
            (
                PartialConfig {
                    date: Some("2024-04-01".into()),
                    ..minimal(dir.path())
                },
                "8 digits",
            ),
            (
                PartialConfig {
                    email_recipients: Some(vec!["not an address".into()]),
                    ..minimal(dir.path())
                },
                "not a valid email",
            ),
            (
                PartialConfig {
                    path: Some(dir.path().join("missing")),
                    ..minimal(dir.path())
                },
                "not an existing directory",
            ),
            (
                PartialConfig {
                    basecalling_method: Some(BasecallMethod::Simplex),
                    duplex_pairs: Some(dir.path().join("pairs.txt")),
                    ..minimal(dir.path())
                },
                "only valid with the duplex",
            ),
            (
                PartialConfig {
                    queue_capacity: Some(0),
                    ..minimal(dir.path())
                },
                "queue_capacity",
            ),
            (
                PartialConfig {
                    tool: PartialToolConfig {
                        timeout_minutes: Some(0),
                        ..Default::default()
                    },
                    ..minimal(dir.path())
                },
                "timeout_minutes",
            ),
            (
                PartialConfig {
                    tool: PartialToolConfig {
                        timeout_minutes: Some(u64::MAX),
                        ..Default::default()
                    },
                    ..minimal(dir.path())
                },
                "too large",
            ),
        ];
        for (cfg, expected) in cases {
            let err = cfg.finish().unwrap_err();
            assert!(
                matches!(err, PodwatchError::Config(_)),
                "expected config error, got {err:?}"
            );
            assert!(err.to_string().contains(expected), "{err} !~ {expected}");
        }
    }

    #[test]
    fn loads_yaml_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("podwatch.yaml");
        std::fs::write(
            &file,
            format!(
                "path: {}\n\
                 date: 20240401\n\
                 basecalling_method: simplex\n\
                 email_recipients: [a@example.org, b@example.org]\n\
                 tool:\n  timeout_minutes: 90\n  extra_args: [\"--min-qscore\", \"10\"]\n\
                 index:\n  durable: false\n",
                dir.path().display()
            ),
        )
        .unwrap();
        let cfg = PartialConfig::load(&file).unwrap().finish().unwrap();
        assert_eq!(cfg.request.recipients.len(), 2);
        assert_eq!(cfg.tool.timeout, Some(Duration::from_secs(90 * 60)));
        assert_eq!(cfg.tool.extra_args, vec!["--min-qscore", "10"]);
        assert_eq!(cfg.index, IndexConfig::InMemory);
    }

    #[test]
    fn empty_input_type_flag_is_omitted() {
        let dir = TempDir::new().unwrap();
        let cfg = PartialConfig {
            tool: PartialToolConfig {
                input_type_flag: Some(String::new()),
                ..Default::default()
            },
            ..minimal(dir.path())
        }
        .finish()
        .unwrap();
        assert_eq!(cfg.tool.input_type_flag, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("podwatch.yaml");
        std::fs::write(&file, "pathh: /data\n").unwrap();
        let err = PartialConfig::load(&file).unwrap_err();
        assert!(matches!(err, PodwatchError::Config(_)));
    }
}
