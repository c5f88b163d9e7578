pub mod error;
pub mod hooks;
pub mod model;
pub mod platform;
pub mod scheduler;

pub use error::{Error, Result};

pub mod auto_bench_fct {
    pub use auto_bench_fct::print_bench_fct_hy_results;
    pub use auto_bench_fct::print_bench_fct_results;
}
