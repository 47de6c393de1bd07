use clap::Args;

use darwinflow::host::Host;

#[derive(Args, Debug)]
pub struct ExecArgs {
    pub plugin: String,
    pub command: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

pub fn list(host: &Host) -> anyhow::Result<i32> {
    for cmd in host.registry().list_commands() {
        println!("{:<12} {:<16} {}", cmd.plugin, cmd.info.name, cmd.info.description);
        if !cmd.info.usage.is_empty() {
            println!("    usage: {}", cmd.info.usage);
        }
    }
    Ok(0)
}

pub async fn exec(host: &Host, args: ExecArgs) -> anyhow::Result<i32> {
    let report = host
        .registry()
        .execute_command(&args.plugin, &args.command, &args.args, Box::new(std::io::stdout()))
        .await?;
    if let Some(error) = &report.error {
        eprintln!("{}: {}", args.command, error);
    }
    Ok(report.exit_code)
}
