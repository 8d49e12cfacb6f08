use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

use drip::bootstrap;
use drip::loader::DirectoryClassSource;
use drip::{Runtime, RuntimeConfig, Value, VmError};

#[derive(Parser)]
#[command(name = "drip", about = "Run a static method of a compiled class", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory to search for class files, repeatable
    #[arg(long = "classpath", value_name = "DIR")]
    classpath: Vec<PathBuf>,

    /// Turn runtime errors into catchable guest exceptions
    #[arg(long = "guest-exceptions")]
    guest_exceptions: bool,

    /// Internal or dotted name of the class to run
    class: String,

    /// Static method to invoke
    #[arg(long, default_value = "main")]
    method: String,

    /// Method descriptor, `()I` and then `()V` are tried when omitted
    #[arg(long)]
    descriptor: Option<String>,
}

fn init_logging(conf: &RuntimeConfig) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(conf.tracing_level)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a global tracing subscriber is already installed");
    }
}

fn run(rt: &Runtime, cli: &Cli) -> drip::Result<Option<Value>> {
    let class_name = cli.class.replace('.', "/");
    let class = rt.load_class(&class_name)?;
    let candidates = match &cli.descriptor {
        Some(descriptor) => vec![descriptor.as_str()],
        None => vec!["()I", "()V"],
    };
    let method = candidates
        .iter()
        .find_map(|descriptor| class.method(&cli.method, descriptor).cloned())
        .ok_or_else(|| VmError::NoSuchMethod {
            class: class_name.clone(),
            name: cli.method.clone(),
            descriptor: candidates.join(" or "),
        })?;
    if !method.is_static() || method.ty().parameter_slots() != 0 {
        return Err(VmError::fatal(format!("{:?} is not a static method without parameters", method)));
    }
    debug!(method = ?method, "running");
    rt.invoke(&method, Vec::new())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut conf = RuntimeConfig::from_env();
    conf.guest_exceptions |= cli.guest_exceptions;
    init_logging(&conf);

    match drip::run_on_guest_stack(&conf, || execute(&conf, &cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: cannot start the guest thread: {err}");
            ExitCode::FAILURE
        }
    }
}

fn execute(conf: &RuntimeConfig, cli: &Cli) -> ExitCode {
    let classpath = if cli.classpath.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        cli.classpath.clone()
    };
    let rt = Runtime::new(conf.clone(), Some(Box::new(DirectoryClassSource::new(classpath))));
    bootstrap::register_core_natives(&rt);
    if let Err(err) = bootstrap::define_fallback_core(&rt) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    match run(&rt, cli) {
        Ok(Some(value)) => {
            match value {
                Value::Int(v) => println!("{v}"),
                Value::Long(v) => println!("{v}"),
                Value::Float(v) => println!("{v}"),
                Value::Double(v) => println!("{v}"),
                Value::Reference(Some(object)) if object.class().name() == drip::runtime::STRING => {
                    match rt.host_string(&object) {
                        Ok(text) => println!("{text}"),
                        Err(_) => println!("{object:?}"),
                    }
                }
                other => println!("{other:?}"),
            }
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(VmError::Throw(throwable)) => {
            eprintln!("Exception in thread \"main\" {}", throwable.render(&rt));
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
