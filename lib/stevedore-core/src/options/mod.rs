//! Lifecycle options.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use snafu::Snafu;
use tracing::debug;

use crate::topology::ServiceId;

mod value;
pub use self::value::OptionValue;

/// Option errors.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum OptionError {
    /// The option name is not recognized.
    #[snafu(display("unknown option '{}'", name))]
    UnknownOption {
        /// The name as given.
        name: String,
    },

    /// The option value is not valid for the option.
    #[snafu(display("invalid value '{}' for option '{}': {}", value, option, reason))]
    InvalidValue {
        /// The option.
        option: OptionName,

        /// The rejected value.
        value: String,

        /// Why the value was rejected.
        reason: String,
    },
}

/// A recognized option.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum OptionName {
    /// `no-deps`
    NoDeps,
    /// `abort-on-container-exit`
    AbortOnContainerExit,
    /// `always-recreate-deps`
    AlwaysRecreateDeps,
    /// `scale`
    Scale,
    /// `remove-orphans`
    RemoveOrphans,
    /// `no-recreate`
    NoRecreate,
    /// `force-recreate`
    ForceRecreate,
    /// `build`
    Build,
    /// `no-build`
    NoBuild,
    /// `no-color`
    NoColor,
    /// `rmi`
    Rmi,
    /// `volumes`
    Volumes,
    /// `follow`
    Follow,
    /// `timestamps`
    Timestamps,
    /// `tail`
    Tail,
    /// `detach`
    Detach,
    /// `file`
    File,
}

impl OptionName {
    /// All recognized options.
    pub const ALL: [OptionName; 17] = [
        OptionName::NoDeps,
        OptionName::AbortOnContainerExit,
        OptionName::AlwaysRecreateDeps,
        OptionName::Scale,
        OptionName::RemoveOrphans,
        OptionName::NoRecreate,
        OptionName::ForceRecreate,
        OptionName::Build,
        OptionName::NoBuild,
        OptionName::NoColor,
        OptionName::Rmi,
        OptionName::Volumes,
        OptionName::Follow,
        OptionName::Timestamps,
        OptionName::Tail,
        OptionName::Detach,
        OptionName::File,
    ];

    /// Returns the option name, without any leading dashes.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OptionName::NoDeps => "no-deps",
            OptionName::AbortOnContainerExit => "abort-on-container-exit",
            OptionName::AlwaysRecreateDeps => "always-recreate-deps",
            OptionName::Scale => "scale",
            OptionName::RemoveOrphans => "remove-orphans",
            OptionName::NoRecreate => "no-recreate",
            OptionName::ForceRecreate => "force-recreate",
            OptionName::Build => "build",
            OptionName::NoBuild => "no-build",
            OptionName::NoColor => "no-color",
            OptionName::Rmi => "rmi",
            OptionName::Volumes => "volumes",
            OptionName::Follow => "follow",
            OptionName::Timestamps => "timestamps",
            OptionName::Tail => "tail",
            OptionName::Detach => "detach",
            OptionName::File => "file",
        }
    }
}

impl FromStr for OptionName {
    type Err = OptionError;

    /// Parses an option name, with or without a leading `--`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("--").unwrap_or(s);
        OptionName::ALL
            .iter()
            .find(|name| name.as_str() == bare)
            .copied()
            .ok_or_else(|| OptionError::UnknownOption { name: s.to_string() })
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image removal policy applied when stopping services.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ImageRemoval {
    /// Keep all images.
    #[default]
    None,

    /// Remove every image used by the service.
    All,

    /// Remove only images without a custom tag, i.e. images built locally for the service.
    Local,
}

impl fmt::Display for ImageRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRemoval::None => f.write_str("none"),
            ImageRemoval::All => f.write_str("all"),
            ImageRemoval::Local => f.write_str("local"),
        }
    }
}

/// How much log history to show.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Tail {
    /// The entire history.
    #[default]
    All,

    /// The given number of most recent lines.
    Lines(usize),
}

/// A validated, immutable set of lifecycle options.
///
/// Options are never changed in place: [`with_override`][Self::with_override] and [`without`][Self::without] return a
/// derived copy and leave the receiver untouched. Any `OptionSet` in existence has passed validation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OptionSet {
    no_deps: bool,
    abort_on_container_exit: bool,
    always_recreate_deps: bool,
    scale: BTreeMap<ServiceId, usize>,
    remove_orphans: bool,
    no_recreate: bool,
    force_recreate: bool,
    build: bool,
    no_build: bool,
    no_color: bool,
    rmi: ImageRemoval,
    volumes: bool,
    follow: bool,
    timestamps: bool,
    tail: Tail,
    detach: bool,
    file: Option<PathBuf>,
}

impl Default for OptionSet {
    fn default() -> Self {
        Self {
            no_deps: false,
            abort_on_container_exit: false,
            always_recreate_deps: false,
            scale: BTreeMap::new(),
            remove_orphans: false,
            no_recreate: true,
            force_recreate: false,
            build: false,
            no_build: false,
            no_color: false,
            rmi: ImageRemoval::None,
            volumes: false,
            follow: false,
            timestamps: false,
            tail: Tail::All,
            detach: true,
            file: None,
        }
    }
}

impl OptionSet {
    /// Returns a copy of this option set with the given option overridden.
    ///
    /// The name may be given with or without a leading `--`.
    ///
    /// # Errors
    ///
    /// If the option is not recognized, the value is not valid for it, or the resulting combination of options is
    /// invalid, an error is returned.
    pub fn with_override<N, V>(&self, name: N, value: V) -> Result<Self, OptionError>
    where
        N: AsRef<str>,
        V: Into<OptionValue>,
    {
        let name = name.as_ref().parse::<OptionName>()?;
        let value = value.into();

        let mut derived = self.clone();
        match name {
            OptionName::Scale => derived.scale = parse_scale(&value)?,
            OptionName::Rmi => derived.rmi = parse_rmi(&value)?,
            OptionName::Tail => derived.tail = parse_tail(&value)?,
            OptionName::File => derived.file = Some(parse_file(&value)?),
            flag => {
                if let Some(field) = derived.flag_mut(flag) {
                    *field = parse_bool(flag, &value)?;
                }
            }
        }

        derived.validate(name, &value)?;
        Ok(derived)
    }

    /// Returns a copy of this option set with the given option reset to its default.
    ///
    /// Resetting an option that is already at its default is a no-op.
    ///
    /// # Errors
    ///
    /// If the option is not recognized, an error is returned.
    pub fn without<N: AsRef<str>>(&self, name: N) -> Result<Self, OptionError> {
        let name = name.as_ref().parse::<OptionName>()?;
        let defaults = Self::default();

        let mut derived = self.clone();
        match name {
            OptionName::Scale => derived.scale = defaults.scale,
            OptionName::Rmi => derived.rmi = defaults.rmi,
            OptionName::Tail => derived.tail = defaults.tail,
            OptionName::File => derived.file = defaults.file,
            flag => {
                let default = defaults.flag(flag).unwrap_or_default();
                if let Some(field) = derived.flag_mut(flag) {
                    *field = default;
                }
            }
        }

        if derived == *self {
            debug!(option = name.as_str(), "Option is not set. Ignoring reset.");
        }

        Ok(derived)
    }

    /// Returns a copy of this option set specialized for starting `service` at the given scale.
    ///
    /// The scale map is replaced by the single entry for `service`, so every other service runs at its default scale.
    ///
    /// # Errors
    ///
    /// If `scale` is zero, an error is returned.
    pub fn for_service(&self, service: &ServiceId, scale: usize) -> Result<Self, OptionError> {
        if scale == 0 {
            return Err(OptionError::InvalidValue {
                option: OptionName::Scale,
                value: format!("{}={}", service, scale),
                reason: "instance count must be a positive integer".to_string(),
            });
        }

        let mut derived = self.clone();
        derived.scale.clear();
        derived.scale.insert(service.clone(), scale);
        Ok(derived)
    }

    fn flag(&self, name: OptionName) -> Option<bool> {
        let value = match name {
            OptionName::NoDeps => self.no_deps,
            OptionName::AbortOnContainerExit => self.abort_on_container_exit,
            OptionName::AlwaysRecreateDeps => self.always_recreate_deps,
            OptionName::RemoveOrphans => self.remove_orphans,
            OptionName::NoRecreate => self.no_recreate,
            OptionName::ForceRecreate => self.force_recreate,
            OptionName::Build => self.build,
            OptionName::NoBuild => self.no_build,
            OptionName::NoColor => self.no_color,
            OptionName::Volumes => self.volumes,
            OptionName::Follow => self.follow,
            OptionName::Timestamps => self.timestamps,
            OptionName::Detach => self.detach,
            OptionName::Scale | OptionName::Rmi | OptionName::Tail | OptionName::File => return None,
        };
        Some(value)
    }

    fn flag_mut(&mut self, name: OptionName) -> Option<&mut bool> {
        let field = match name {
            OptionName::NoDeps => &mut self.no_deps,
            OptionName::AbortOnContainerExit => &mut self.abort_on_container_exit,
            OptionName::AlwaysRecreateDeps => &mut self.always_recreate_deps,
            OptionName::RemoveOrphans => &mut self.remove_orphans,
            OptionName::NoRecreate => &mut self.no_recreate,
            OptionName::ForceRecreate => &mut self.force_recreate,
            OptionName::Build => &mut self.build,
            OptionName::NoBuild => &mut self.no_build,
            OptionName::NoColor => &mut self.no_color,
            OptionName::Volumes => &mut self.volumes,
            OptionName::Follow => &mut self.follow,
            OptionName::Timestamps => &mut self.timestamps,
            OptionName::Detach => &mut self.detach,
            OptionName::Scale | OptionName::Rmi | OptionName::Tail | OptionName::File => return None,
        };
        Some(field)
    }

    fn validate(&self, changed: OptionName, value: &OptionValue) -> Result<(), OptionError> {
        if self.build && self.no_build {
            return Err(OptionError::InvalidValue {
                option: changed,
                value: value.to_string(),
                reason: "'build' and 'no-build' are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }

    /// Whether to act only on the named service, ignoring its dependencies.
    pub fn no_deps(&self) -> bool {
        self.no_deps
    }

    /// Whether an instance exiting after start aborts the batch.
    pub fn abort_on_container_exit(&self) -> bool {
        self.abort_on_container_exit
    }

    /// Whether dependencies are recreated even when running.
    pub fn always_recreate_deps(&self) -> bool {
        self.always_recreate_deps
    }

    /// Returns the per-service scale overrides.
    pub fn scale(&self) -> &BTreeMap<ServiceId, usize> {
        &self.scale
    }

    /// Returns the scale override for the given service, if any.
    pub fn scale_for(&self, service: &ServiceId) -> Option<usize> {
        self.scale.get(service).copied()
    }

    /// Whether stopping everything also removes instances of services missing from the topology.
    pub fn remove_orphans(&self) -> bool {
        self.remove_orphans
    }

    /// Whether running instances are left alone.
    pub fn no_recreate(&self) -> bool {
        self.no_recreate
    }

    /// Whether instances are recreated even when running.
    pub fn force_recreate(&self) -> bool {
        self.force_recreate
    }

    /// Whether images are built before starting. Not acted upon by the orchestrator.
    pub fn build(&self) -> bool {
        self.build
    }

    /// Whether image builds are suppressed. Not acted upon by the orchestrator.
    pub fn no_build(&self) -> bool {
        self.no_build
    }

    /// Whether log output is monochrome. Not acted upon by the orchestrator.
    pub fn no_color(&self) -> bool {
        self.no_color
    }

    /// Returns the image removal policy applied on stop.
    pub fn rmi(&self) -> ImageRemoval {
        self.rmi
    }

    /// Whether volumes are removed along with instances on stop.
    pub fn volumes(&self) -> bool {
        self.volumes
    }

    /// Whether logs are followed. Not acted upon by the orchestrator.
    pub fn follow(&self) -> bool {
        self.follow
    }

    /// Whether logs carry timestamps. Not acted upon by the orchestrator.
    pub fn timestamps(&self) -> bool {
        self.timestamps
    }

    /// Returns how much log history is shown. Not acted upon by the orchestrator.
    pub fn tail(&self) -> Tail {
        self.tail
    }

    /// Whether starting returns right away instead of waiting for instances to exit.
    pub fn detach(&self) -> bool {
        self.detach
    }

    /// Returns the topology file override, if any.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }
}

fn invalid(option: OptionName, value: &OptionValue, reason: &str) -> OptionError {
    OptionError::InvalidValue {
        option,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(option: OptionName, value: &OptionValue) -> Result<bool, OptionError> {
    match value {
        OptionValue::Bool(b) => Ok(*b),
        OptionValue::Str(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        OptionValue::Str(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        _ => Err(invalid(option, value, "expected a boolean")),
    }
}

fn parse_scale(value: &OptionValue) -> Result<BTreeMap<ServiceId, usize>, OptionError> {
    let entries = match value {
        OptionValue::Str(s) if s.trim().is_empty() => Vec::new(),
        OptionValue::Str(s) => s.split(',').map(str::to_string).collect(),
        OptionValue::List(entries) => entries.clone(),
        _ => return Err(invalid(OptionName::Scale, value, "expected 'service=count' entries")),
    };

    let mut scale = BTreeMap::new();
    for entry in entries {
        let Some((service, count)) = entry.split_once('=') else {
            return Err(invalid(OptionName::Scale, value, "expected 'service=count' entries"));
        };

        let service = ServiceId::try_from(service.trim()).map_err(|reason| invalid(OptionName::Scale, value, reason))?;
        let count = match count.trim().parse::<usize>() {
            Ok(count) if count > 0 => count,
            _ => {
                return Err(invalid(
                    OptionName::Scale,
                    value,
                    "instance count must be a positive integer",
                ))
            }
        };

        scale.insert(service, count);
    }

    Ok(scale)
}

fn parse_rmi(value: &OptionValue) -> Result<ImageRemoval, OptionError> {
    match value {
        OptionValue::Str(s) if s.eq_ignore_ascii_case("none") => Ok(ImageRemoval::None),
        OptionValue::Str(s) if s.eq_ignore_ascii_case("all") => Ok(ImageRemoval::All),
        OptionValue::Str(s) if s.eq_ignore_ascii_case("local") => Ok(ImageRemoval::Local),
        _ => Err(invalid(OptionName::Rmi, value, "expected one of 'none', 'all' or 'local'")),
    }
}

fn parse_tail(value: &OptionValue) -> Result<Tail, OptionError> {
    const REASON: &str = "expected 'all' or a positive integer";

    match value {
        OptionValue::Str(s) if s.eq_ignore_ascii_case("all") => Ok(Tail::All),
        OptionValue::Str(s) => match s.trim().parse::<usize>() {
            Ok(lines) if lines > 0 => Ok(Tail::Lines(lines)),
            _ => Err(invalid(OptionName::Tail, value, REASON)),
        },
        OptionValue::Int(n) => match usize::try_from(*n) {
            Ok(lines) if lines > 0 => Ok(Tail::Lines(lines)),
            _ => Err(invalid(OptionName::Tail, value, REASON)),
        },
        _ => Err(invalid(OptionName::Tail, value, REASON)),
    }
}

fn parse_file(value: &OptionValue) -> Result<PathBuf, OptionError> {
    match value {
        OptionValue::Str(s) if !s.trim().is_empty() => Ok(PathBuf::from(s)),
        _ => Err(invalid(OptionName::File, value, "expected a non-empty path")),
    }
}
