//! # hivestore CLI Entry Point
//!
//! A small interactive shell over a store file, for poking at hives during
//! development.
//!
//! ## Usage
//!
//! ```bash
//! # Open existing store
//! hivestore ./settings.hive
//!
//! # Create new store
//! hivestore --create ./settings.hive
//! ```

use std::env;
use std::path::PathBuf;

use eyre::{bail, Result, WrapErr};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use hivestore::{Error, Key, NodeId, Order, Store, SubTree, Value};

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let mut create_mode = false;
    let mut read_only = false;
    let mut path: Option<PathBuf> = None;

    for arg in &args[1..] {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("hivestore {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--create" | "-c" => create_mode = true,
            "--read-only" | "-r" => read_only = true,
            other if other.starts_with('-') => bail!("Unknown option: {}", other),
            other => {
                if path.is_some() {
                    bail!("Multiple store paths specified");
                }
                path = Some(PathBuf::from(other));
            }
        }
    }

    let path = match path {
        Some(p) => p,
        None => {
            print_usage();
            return Ok(());
        }
    };

    let create = create_mode || !path.exists();
    let store = Store::options()
        .create(create)
        .read_only(read_only)
        .autosave(true)
        .open(&path)
        .wrap_err_with(|| format!("failed to open store at {:?}", path))?;

    repl(&store)
}

fn repl(store: &Store) -> Result<()> {
    let mut editor = DefaultEditor::new()?;
    // (name, id) for each path component below the root.
    let mut cwd: Vec<(String, NodeId)> = Vec::new();

    loop {
        let prompt = format!("/{}> ", cwd.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join("/"));
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        editor.add_history_entry(line)?;

        let mut words = line.split_whitespace();
        let cmd = words.next().unwrap_or_default();
        let rest: Vec<&str> = words.collect();
        let here = cwd.last().map(|(_, id)| *id).unwrap_or(NodeId::ROOT);

        let outcome = match cmd {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                Ok(())
            }
            "pwd" => {
                println!("{}", prompt.trim_end_matches("> "));
                Ok(())
            }
            "cd" => cmd_cd(store, &mut cwd, &rest),
            "ls" => cmd_ls(store, here, &rest),
            "mkkey" => cmd_mkkey(store, here, &rest),
            "set" => cmd_set(store, here, &rest),
            "get" => cmd_get(store, here, &rest),
            "del" => cmd_del(store, here, &rest),
            "link" => cmd_link(store, &cwd, here, &rest),
            "commit" => store.commit(true).map(|_| println!("committed")).map_err(Into::into),
            other => {
                println!("unknown command '{other}', try 'help'");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            println!("error: {e}");
        }
    }
    Ok(())
}

fn cmd_cd(store: &Store, cwd: &mut Vec<(String, NodeId)>, args: &[&str]) -> Result<()> {
    match args {
        [".."] => {
            cwd.pop();
        }
        ["/"] => cwd.clear(),
        [name] => {
            let here = cwd.last().map(|(_, id)| *id).unwrap_or(NodeId::ROOT);
            let id = store.find(here, &Key::new(name.as_bytes()), SubTree::Keys)?;
            cwd.push((name.to_string(), id));
        }
        _ => println!("usage: cd <key> | cd .. | cd /"),
    }
    Ok(())
}

fn cmd_ls(store: &Store, here: NodeId, args: &[&str]) -> Result<()> {
    let tree = match args {
        [] | ["keys"] => SubTree::Keys,
        ["values"] => SubTree::Values,
        _ => {
            println!("usage: ls [keys|values]");
            return Ok(());
        }
    };
    let mut cursor = store.cursor(tree, Order::Ascending);
    let mut node = cursor.first(here, None);
    while let Ok(id) = node {
        let name = String::from_utf8_lossy(&store.get_name(id)?).into_owned();
        match tree {
            SubTree::Keys => println!("{name}/"),
            SubTree::Values => println!("{name} = {}", render_value(store, id)?),
        }
        node = cursor.next();
    }
    if let Err(e) = node {
        if !matches!(e, Error::NotFound) {
            return Err(e.into());
        }
    }
    Ok(())
}

fn render_value(store: &Store, id: NodeId) -> Result<String> {
    Ok(match store.get_value(id)? {
        Value::Int32(v) => format!("{v} (int32)"),
        Value::Int64(v) => format!("{v} (int64)"),
        Value::Double(v) => format!("{v} (double)"),
        Value::String(v) => format!("{v:?}"),
        Value::Binary(v) => format!("{} bytes binary", v.len()),
        Value::Link(target) => {
            let target_name = store
                .get_name(target)
                .map(|n| String::from_utf8_lossy(&n).into_owned())
                .unwrap_or_else(|_| "?".into());
            format!("link -> {target_name}")
        }
    })
}

fn cmd_mkkey(store: &Store, here: NodeId, args: &[&str]) -> Result<()> {
    match args {
        [name] => {
            store.create_key(here, &Key::new(name.as_bytes()))?;
            Ok(())
        }
        _ => {
            println!("usage: mkkey <name>");
            Ok(())
        }
    }
}

fn cmd_set(store: &Store, here: NodeId, args: &[&str]) -> Result<()> {
    let (name, ty, raw) = match args {
        [name, ty, rest @ ..] if !rest.is_empty() => (name, ty, rest.join(" ")),
        _ => {
            println!("usage: set <name> <int32|int64|double|string|binary> <value>");
            return Ok(());
        }
    };
    let key = Key::new(name.as_bytes());
    match *ty {
        "int32" => {
            store.create_int32(here, &key, raw.parse()?)?;
        }
        "int64" => {
            store.create_int64(here, &key, raw.parse()?)?;
        }
        "double" => {
            store.create_double(here, &key, raw.parse()?)?;
        }
        "string" => {
            store.create_string(here, &key, &raw)?;
        }
        "binary" => {
            store.create_binary(here, &key, raw.as_bytes())?;
        }
        other => println!("unknown value type '{other}'"),
    }
    Ok(())
}

fn cmd_get(store: &Store, here: NodeId, args: &[&str]) -> Result<()> {
    match args {
        [name] => {
            let id = store.find(here, &Key::new(name.as_bytes()), SubTree::Values)?;
            println!("{}", render_value(store, id)?);
            Ok(())
        }
        _ => {
            println!("usage: get <name>");
            Ok(())
        }
    }
}

fn cmd_del(store: &Store, here: NodeId, args: &[&str]) -> Result<()> {
    match args {
        [name] => {
            // Try a value first, then a child key.
            let key = Key::new(name.as_bytes());
            match store.delete(here, SubTree::Values, &key) {
                Err(Error::NotFound) => store.delete(here, SubTree::Keys, &key)?,
                other => other?,
            }
            Ok(())
        }
        _ => {
            println!("usage: del <name>");
            Ok(())
        }
    }
}

fn cmd_link(store: &Store, cwd: &[(String, NodeId)], here: NodeId, args: &[&str]) -> Result<()> {
    match args {
        [name, target_path] => {
            let target = resolve_path(store, cwd, target_path)?;
            store.create_link(here, &Key::new(name.as_bytes()), target)?;
            Ok(())
        }
        _ => {
            println!("usage: link <name> </abs/key/path>");
            Ok(())
        }
    }
}

fn resolve_path(store: &Store, cwd: &[(String, NodeId)], path: &str) -> Result<NodeId> {
    let mut here = if path.starts_with('/') {
        NodeId::ROOT
    } else {
        cwd.last().map(|(_, id)| *id).unwrap_or(NodeId::ROOT)
    };
    for part in path.split('/').filter(|p| !p.is_empty()) {
        here = store.find(here, &Key::new(part.as_bytes()), SubTree::Keys)?;
    }
    if here.is_root() {
        bail!("path resolves to the root, which cannot be a target");
    }
    Ok(here)
}

fn print_help() {
    println!("commands:");
    println!("    cd <key> | cd .. | cd /        navigate");
    println!("    ls [keys|values]               list children or values");
    println!("    mkkey <name>                   create a child key");
    println!("    set <name> <type> <value>      create a value");
    println!("    get <name>                     show a value");
    println!("    del <name>                     delete a value or empty key");
    println!("    link <name> <path>             create a link to another key");
    println!("    commit                         write changes to disk");
    println!("    quit");
}

fn print_usage() {
    println!("hivestore - embeddable hierarchical key/value store");
    println!();
    println!("USAGE:");
    println!("    hivestore [OPTIONS] <STORE_PATH>");
    println!();
    println!("OPTIONS:");
    println!("    -c, --create       Create a new store (default if path doesn't exist)");
    println!("    -r, --read-only    Open without write access");
    println!("    -h, --help         Print help information");
    println!("    -v, --version      Print version information");
}
