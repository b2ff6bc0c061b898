use clap::Parser;
use fmi_master_sim::{options::SimOptions, simulate};

fn main() -> anyhow::Result<()> {
    flexi_logger::Logger::try_with_env_or_str("info")?
        .set_palette("b1;3;2;4;6".to_string())
        .start()?;

    let options = SimOptions::parse();
    let (output, stats) = simulate(&options)?;

    println!(
        "Outputs:\n{}",
        arrow::util::pretty::pretty_format_batches(&[output])?
    );
    log::info!(
        "Reached t = {} in {} step(s), {} retried; {} request(s) over {} barrier(s), {} loop solve(s)",
        stats.end_time,
        stats.num_steps,
        stats.num_retries,
        stats.master.requests_sent,
        stats.master.barriers,
        stats.master.loop_solves
    );

    Ok(())
}
