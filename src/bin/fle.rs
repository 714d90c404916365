use anyhow::bail;
use fled::obj::ObjectKind;
use fled::{cc, format, link, load, nm, opt, FleObject};
use log::info;

const TOOLS: [&str; 6] = ["nm", "objdump", "ld", "exec", "ar", "cc"];

fn usage() -> ! {
    eprintln!(
        "Usage: fle <command> [args...]\n\
         Commands:\n\
         \x20 objdump <input.fle>              Display contents of FLE file\n\
         \x20 nm <input.fle>                   Display symbol table\n\
         \x20 ld [-o output.fle] input1.fle... Link FLE files\n\
         \x20 exec <input.fle>                 Execute FLE file\n\
         \x20 cc [-o output.o] input.c...      Compile C files\n\
         \x20 ar <output.fle> <input.fle>...   Create static archive\n\
         The command may also be selected by the invocation name."
    );
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    info!("launched with args: {args:?}");

    // dispatch on the invocation name, falling back to a subcommand
    let invoked = format::basename(args.first().map(String::as_str).unwrap_or_default());
    let (tool, rest) = if TOOLS.contains(&invoked.as_str()) {
        (invoked, &args[1..])
    } else if args.len() >= 2 && TOOLS.contains(&args[1].as_str()) {
        (args[1].clone(), &args[2..])
    } else {
        usage();
    };

    match tool.as_str() {
        "nm" => {
            let [file] = rest else {
                bail!("Usage: nm <input.fle>");
            };
            print!("{}", nm::dump(&format::load_fle(file)?));
        }
        "objdump" => {
            let [file] = rest else {
                bail!("Usage: objdump <input.fle>");
            };
            let obj = format::load_fle(file)?;
            format::write_fle(&obj, &format!("{file}.objdump"))?;
        }
        "ld" => {
            let opt = opt::parse_opts(rest)?;
            let inputs = link::path_resolution(&opt)?;
            let objects = inputs
                .iter()
                .map(|path| format::load_fle(path))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let output = link::link(&objects, &opt)?;
            format::write_fle(&output, &opt.output)?;
        }
        "exec" => {
            let [file] = rest else {
                bail!("Usage: exec <input.fle>");
            };
            load::exec(format::load_fle(file)?)?;
        }
        "ar" => {
            let [output, inputs @ ..] = rest else {
                bail!("Usage: ar <output.fle> <input1.fle> ...");
            };
            if inputs.is_empty() {
                bail!("Usage: ar <output.fle> <input1.fle> ...");
            }
            let mut archive = FleObject::new(format::basename(output), ObjectKind::Archive);
            for input in inputs {
                archive.members.push(format::load_fle(input)?);
            }
            format::write_fle(&archive, output)?;
        }
        "cc" => {
            cc::run(rest)?;
        }
        _ => unreachable!(),
    }

    Ok(())
}
