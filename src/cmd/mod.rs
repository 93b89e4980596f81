//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                                   |
//! |-----------------|-----------------------------------------------------|
//! | `serve`         | `Serve`, `Recover`                                 |
//! | `run`           | `Run`                                              |
//! | `inspect`       | `Status`, `Logs`, `History`                        |

pub mod inspect;
pub mod run;
pub mod serve;

pub use inspect::{cmd_history, cmd_logs, cmd_status};
pub use run::cmd_run;
pub use serve::{cmd_recover, cmd_serve};
