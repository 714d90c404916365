use anyhow::anyhow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOpt {
    /// objfile
    File(String),
    /// -l namespec
    Library(String),
}

#[derive(Debug, Clone)]
pub struct Opt {
    /// -o output
    pub output: String,
    /// -e entry
    pub entry: String,
    /// -shared
    pub shared: bool,
    /// -static
    pub link_static: bool,
    /// -L searchdir
    pub search_dir: Vec<String>,
    /// objfile / -l namespec, in command-line order
    pub inputs: Vec<InputOpt>,
}

impl Default for Opt {
    fn default() -> Self {
        Self {
            output: "a.out".to_string(),
            entry: "_start".to_string(),
            shared: false,
            link_static: false,
            search_dir: vec![],
            inputs: vec![],
        }
    }
}

/// parse arguments
pub fn parse_opts(args: &[String]) -> anyhow::Result<Opt> {
    let mut opt = Opt::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "--output" => {
                // output argument
                opt.output = iter
                    .next()
                    .ok_or(anyhow!("Missing output after {arg}"))?
                    .to_string();
            }
            "-e" | "--entry" => {
                // entry point argument
                opt.entry = iter
                    .next()
                    .ok_or(anyhow!("Missing entry point after {arg}"))?
                    .to_string();
            }
            "-shared" => {
                opt.shared = true;
            }
            "-static" => {
                opt.link_static = true;
            }
            "-L" => {
                // library search path argument
                opt.search_dir.push(
                    iter.next()
                        .ok_or(anyhow!("Missing directory after -L"))?
                        .to_string(),
                );
            }
            s @ _ if s.starts_with("-L") => {
                opt.search_dir
                    .push(s.strip_prefix("-L").unwrap().to_string());
            }
            "-l" => {
                // library argument
                opt.inputs.push(InputOpt::Library(
                    iter.next()
                        .ok_or(anyhow!("Missing library after -l"))?
                        .to_string(),
                ));
            }
            s @ _ if s.starts_with("-l") => {
                opt.inputs
                    .push(InputOpt::Library(s.strip_prefix("-l").unwrap().to_string()));
            }
            // end of known flags
            s @ _ if s.starts_with("-") => {
                // unknown flag
                return Err(anyhow!("Unknown argument: {s}"));
            }
            s @ _ => {
                // object file argument
                opt.inputs.push(InputOpt::File(s.to_string()));
            }
        }
    }
    if opt.inputs.is_empty() {
        return Err(anyhow!("No inputs"));
    }
    Ok(opt)
}
