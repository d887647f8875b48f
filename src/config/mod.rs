//! Configuration handling for HwShield

mod settings;

pub use settings::{
    CliArgs, Commands, ControlPaths, FreqRequest, IdleRequest, PowerCapRequest, PrefetchSpec,
    QuiesceSettings, SessionConfig, SidecarSpec, TurboState, parse_cpu_list,
};
