// Copyright 2018-2025 the Deno authors. MIT license.

/// Runtime flags, as parsed from `--name[=value]` arguments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmFlags {
  /// The arguments exactly as they were set.
  pub args: Vec<String>,
  pub ignore_unrecognized_flags: bool,
  pub enable_asserts: bool,
  pub precompilation: bool,
  pub pause_isolates_on_start: bool,
  pub pause_isolates_on_exit: bool,
  pub profiler: bool,
  pub old_gen_heap_size: Option<i64>,
  pub timeline_recorder: Option<String>,
  pub timeline_streams: Option<String>,
}

const BOOL_FLAGS: &[&str] = &[
  "background_compilation",
  "concurrent_mark",
  "concurrent_sweep",
  "enable_asserts",
  "enable_mirrors",
  "ignore_unrecognized_flags",
  "mark_when_idle",
  "pause_isolates_on_exit",
  "pause_isolates_on_start",
  "precompilation",
  "profile_vm",
  "profiler",
  "verify_entry_points",
];

const VALUE_FLAGS: &[&str] = &[
  "compactor_tasks",
  "marker_tasks",
  "max_profile_depth",
  "old_gen_heap_size",
  "profile_period",
  "scavenger_tasks",
  "timeline_recorder",
  "timeline_streams",
];

impl VmFlags {
  pub fn parse(args: &[String]) -> Result<Self, String> {
    let mut flags = VmFlags {
      args: args.to_vec(),
      ignore_unrecognized_flags: args
        .iter()
        .any(|a| a == "--ignore-unrecognized-flags" || a == "--ignore_unrecognized_flags"),
      ..Default::default()
    };

    for arg in args {
      let Some(flag) = arg.strip_prefix("--") else {
        return Err(format!("Malformed flag: {arg}"));
      };
      let (name, value) = match flag.split_once('=') {
        Some((name, value)) => (name.replace('-', "_"), Some(value)),
        None => (flag.replace('-', "_"), None),
      };
      let (name, enabled) = match name.strip_prefix("no_") {
        Some(name) if value.is_none() => (name.to_string(), false),
        _ => (name, true),
      };

      if BOOL_FLAGS.contains(&name.as_str()) {
        let enabled = match value {
          None => enabled,
          Some("true") => true,
          Some("false") => false,
          Some(value) => {
            return Err(format!("Invalid value for --{name}: {value}"));
          }
        };
        flags.set_bool(&name, enabled);
      } else if VALUE_FLAGS.contains(&name.as_str()) {
        let Some(value) = value else {
          return Err(format!("Flag --{name} requires a value"));
        };
        flags.set_value(&name, value)?;
      } else if !flags.ignore_unrecognized_flags {
        return Err(format!("Unrecognized flag: {arg}"));
      }
    }
    Ok(flags)
  }

  fn set_bool(&mut self, name: &str, enabled: bool) {
    match name {
      "enable_asserts" => self.enable_asserts = enabled,
      "precompilation" => self.precompilation = enabled,
      "pause_isolates_on_start" => self.pause_isolates_on_start = enabled,
      "pause_isolates_on_exit" => self.pause_isolates_on_exit = enabled,
      "profiler" => self.profiler = enabled,
      _ => {}
    }
  }

  fn set_value(&mut self, name: &str, value: &str) -> Result<(), String> {
    match name {
      "old_gen_heap_size" => {
        let size = value
          .parse()
          .map_err(|_| format!("Invalid value for --{name}: {value}"))?;
        self.old_gen_heap_size = Some(size);
      }
      "timeline_recorder" => self.timeline_recorder = Some(value.to_string()),
      "timeline_streams" => self.timeline_streams = Some(value.to_string()),
      _ => {}
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args(a: &[&str]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn parses_known_flags() {
    let flags = VmFlags::parse(&args(&[
      "--enable_asserts",
      "--pause-isolates-on-start",
      "--old_gen_heap_size=512",
      "--timeline_recorder=endless",
      "--no-profiler",
      "--enable_mirrors=false",
      "--concurrent_mark=false",
    ]))
    .unwrap();
    assert!(flags.enable_asserts);
    assert!(flags.pause_isolates_on_start);
    assert!(!flags.profiler);
    assert_eq!(flags.old_gen_heap_size, Some(512));
    assert_eq!(flags.timeline_recorder.as_deref(), Some("endless"));
  }

  #[test]
  fn unrecognized_flags_need_opt_in() {
    assert!(VmFlags::parse(&args(&["--frobnicate"])).is_err());
    let flags =
      VmFlags::parse(&args(&["--ignore-unrecognized-flags", "--frobnicate"]))
        .unwrap();
    assert!(flags.ignore_unrecognized_flags);
  }

  #[test]
  fn malformed_values_are_rejected() {
    assert!(VmFlags::parse(&args(&["old_gen_heap_size"])).is_err());
    assert!(VmFlags::parse(&args(&["--old_gen_heap_size=lots"])).is_err());
    assert!(VmFlags::parse(&args(&["--timeline_streams"])).is_err());
    assert!(VmFlags::parse(&args(&["--enable_asserts=yes"])).is_err());
  }
}
