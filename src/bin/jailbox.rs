use anyhow::Result;

fn main() -> Result<()> {
    let code = jailbox::cli::run()?;
    std::process::exit(code)
}
