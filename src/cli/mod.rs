pub mod arg_parser;
pub mod handlers;

pub use arg_parser::{Cli, Command};
pub use handlers::handle_run;
