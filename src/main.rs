use std::process;

fn main() {
    if let Err(err) = finbench_driver::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
