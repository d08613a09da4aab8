use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Port the worker's dispatch endpoint listens on.
    #[arg(short, long, default_value_t = 8040)]
    pub port: u16,

    /// Address of the registry node.
    #[arg(short, long, default_value = "http://[::1]:8030")]
    pub registry: String,

    /// Largest total job load this worker will carry. Defaults to the
    /// number of CPU cores.
    #[arg(short, long)]
    pub max_load: Option<f32>,

    /// Bytes of memory to advertise to the registry.
    #[arg(long, default_value_t = 0)]
    pub memory: u64,
}
