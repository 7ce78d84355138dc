use std::path::PathBuf;
use std::time::Duration;

use config::{Config as RawConfig, File, FileFormat};
use txproc_dispatch_core::config::{ManagementEvents, NucleusConfig, QueueDescriptor, QueueType};
use txproc_dispatch_core::event::EventKind;
use txproc_dispatch_core::{Error, Result};

/// Everything loaded from the ini file: the global `[nucleus]` settings
/// plus one `QueueDescriptor` per `[queues.<name>]` table. Grounded on
/// `queueContainer::init`'s per-key reads, laid out for the `config` crate
/// the way `ergo-api`'s settings layer wraps it (`config::Config` +
/// `FileFormat`, deserialized field by field rather than via `serde` on
/// the whole tree, since the per-queue key set depends on `type`).
pub struct LoadedConfig {
    pub nucleus: NucleusConfig,
    pub queues: Vec<QueueDescriptor>,
}

pub fn load(path: &std::path::Path) -> Result<LoadedConfig> {
    let mut raw = RawConfig::default();
    raw.merge(File::new(path.to_str().unwrap_or_default(), FileFormat::Ini))
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let nucleus = load_nucleus(&raw)?;
    let queues = load_queues(&raw, &nucleus)?;
    Ok(LoadedConfig { nucleus, queues })
}

fn get_string(raw: &RawConfig, key: &str) -> Option<String> {
    raw.get_str(key).ok()
}

fn required_string(raw: &RawConfig, key: &str) -> Result<String> {
    get_string(raw, key).ok_or_else(|| Error::Config(format!("missing required key '{}'", key)))
}

fn get_u32(raw: &RawConfig, key: &str, default: u32) -> Result<u32> {
    match raw.get_str(key) {
        Ok(s) => s
            .parse::<u32>()
            .map_err(|e| Error::Config(format!("key '{}': {}", key, e))),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(Error::Config(format!("key '{}': {}", key, e))),
    }
}

fn get_bool(raw: &RawConfig, key: &str, default: bool) -> Result<bool> {
    match raw.get_str(key) {
        Ok(s) => match s.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(Error::Config(format!("key '{}': not a boolean: '{}'", key, other))),
        },
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(e) => Err(Error::Config(format!("key '{}': {}", key, e))),
    }
}

fn load_nucleus(raw: &RawConfig) -> Result<NucleusConfig> {
    let active_queues = required_string(raw, "nucleus.activequeues")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(NucleusConfig {
        active_queues,
        maint_interval: Duration::from_secs(get_u32(raw, "nucleus.maintinterval", 5)? as u64),
        expired_event_interval: Duration::from_secs(get_u32(raw, "nucleus.expiredeventinterval", 5)? as u64),
        max_num_queues: get_u32(raw, "nucleus.maxnumqueues", 32)?,
        max_network_descriptors: get_u32(raw, "nucleus.maxnetworkdescriptors", 1024)?,
        stats_dir: PathBuf::from(get_string(raw, "nucleus.statsdir").unwrap_or_else(|| "/var/run/txproc".into())),
        unix_socket_path: PathBuf::from(required_string(raw, "nucleus.unixsocketpath")?),
        unix_socket_stream_path: PathBuf::from(required_string(raw, "nucleus.unixsocketstreampath")?),
        socket_group: get_string(raw, "nucleus.socketgroup"),
    })
}

fn load_queues(raw: &RawConfig, nucleus: &NucleusConfig) -> Result<Vec<QueueDescriptor>> {
    nucleus
        .active_queues
        .iter()
        .map(|name| load_one_queue(raw, name))
        .collect()
}

fn load_one_queue(raw: &RawConfig, name: &str) -> Result<QueueDescriptor> {
    let prefix = format!("queues.{}", name);
    let key = |k: &str| format!("{}.{}", prefix, k);

    let queue_type = match get_string(raw, &key("type")).as_deref() {
        Some("straight") | None => QueueType::Straight,
        Some("collection") => QueueType::Collection,
        Some(other) => return Err(Error::UnknownQueueType(other.to_string())),
    };

    let mut descriptor = match queue_type {
        QueueType::Straight => QueueDescriptor::straight(name),
        QueueType::Collection => QueueDescriptor::collection(name),
    };

    descriptor.max_length = get_u32(raw, &key("maxlength"), descriptor.max_length)?;
    descriptor.num_workers = get_u32(raw, &key("numworkers"), descriptor.num_workers)?;
    descriptor.max_exec_time = match raw.get_str(&key("maxexectime")) {
        Ok(s) => Some(s.parse::<u64>().map_err(|e| Error::Config(format!("maxExecTime: {}", e)))?),
        Err(_) => None,
    };
    descriptor.persistent_app = get_string(raw, &key("persistentapp")).map(PathBuf::from);
    descriptor.default_script = get_string(raw, &key("defaultscript"));
    descriptor.default_url = get_string(raw, &key("defaulturl"));
    descriptor.error_queue = get_string(raw, &key("errorqueue"));
    descriptor.parse_response_for_object = get_bool(raw, &key("parseresponseforobject"), descriptor.parse_response_for_object)?;
    descriptor.run_priviledged = get_bool(raw, &key("brunpriviledged"), descriptor.run_priviledged)?;
    descriptor.blocking_worker_socket = get_bool(raw, &key("bblockingworkersocket"), descriptor.blocking_worker_socket)?;
    descriptor.management_queue = get_string(raw, &key("managementqueue"));
    descriptor.management_event_type = get_string(raw, &key("managementeventtype"))
        .map(|s| parse_event_kind(&s))
        .transpose()?;
    descriptor.management_events = get_string(raw, &key("managementevents"))
        .map(|s| ManagementEvents::parse_list(&s))
        .unwrap_or_default();
    descriptor.num_sub_queues = match raw.get_str(&key("numsubqueues")) {
        Ok(s) => {
            let n = s.parse::<u32>().map_err(|e| Error::Config(format!("numSubQueues: {}", e)))?;
            if n > 0 {
                Some(n)
            } else {
                None
            }
        }
        Err(_) => None,
    };
    descriptor.max_events_from_main_queue = get_u32(
        raw,
        &key("maxeventsinseqfrommainqueue"),
        descriptor.max_events_from_main_queue,
    )?;
    descriptor.max_events_from_sub_queue = get_u32(
        raw,
        &key("maxeventsinseqfromsubqueue"),
        descriptor.max_events_from_sub_queue,
    )?;

    Ok(descriptor)
}

fn parse_event_kind(s: &str) -> Result<EventKind> {
    match s {
        "EV_PERL" => Ok(EventKind::Perl),
        "EV_URL" => Ok(EventKind::Url),
        "EV_BIN" => Ok(EventKind::Bin),
        "EV_SCRIPT" => Ok(EventKind::Script),
        other => Err(Error::Config(format!("unrecognised managementEventType '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_a_minimal_straight_queue() {
        let file = write_config(
            r#"
[nucleus]
activeQueues = main
unixSocketPath = /tmp/txproc.sock
unixSocketStreamPath = /tmp/txprocStream.sock

[queues.main]
type = straight
numWorkers = 3
maxLength = 50
"#,
        );
        let loaded = load(file.path()).unwrap();
        assert_eq!(loaded.nucleus.active_queues, vec!["main".to_string()]);
        assert_eq!(loaded.queues.len(), 1);
        assert_eq!(loaded.queues[0].num_workers, 3);
        assert_eq!(loaded.queues[0].max_length, 50);
        assert!(matches!(loaded.queues[0].queue_type, QueueType::Straight));
    }

    #[test]
    fn batch_queue_activated_by_num_sub_queues() {
        let file = write_config(
            r#"
[nucleus]
activeQueues = batched
unixSocketPath = /tmp/txproc.sock
unixSocketStreamPath = /tmp/txprocStream.sock

[queues.batched]
type = straight
numSubQueues = 3
"#,
        );
        let loaded = load(file.path()).unwrap();
        assert!(loaded.queues[0].is_batch());
        assert_eq!(loaded.queues[0].num_sub_queues, Some(3));
    }

    #[test]
    fn unknown_queue_type_is_a_config_error() {
        let file = write_config(
            r#"
[nucleus]
activeQueues = bad
unixSocketPath = /tmp/txproc.sock
unixSocketStreamPath = /tmp/txprocStream.sock

[queues.bad]
type = something_else
"#,
        );
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, Error::UnknownQueueType(_)));
    }
}
