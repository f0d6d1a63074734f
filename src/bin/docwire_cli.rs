use std::{
    error::Error,
    io::{self, Write},
};

use bson::Document;
use clap::Parser;
use docwire::{ClientConfig, Command, CommandError, Database, HiLoIdGenerator, prompt};

#[derive(Parser)]
#[command(version, about = "Interactive shell for a docwire server", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let database = Database::connect(&cli.config)?;
    let ids = HiLoIdGenerator::from_config(database.clone(), &cli.config)?;

    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let reader = stdio.lock();
        let writer = StdOut {
            inner: stdout.lock(),
        };

        let cmd = match prompt(reader, writer) {
            Ok(c) => c,
            Err(CommandError::Io(e)) => return Err(e.into()),
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        if cmd == Command::Exit {
            database.connection().close();
            break;
        }

        if let Err(e) = execute(&database, &ids, cmd) {
            eprintln!("error: {e}");
            if !database.connection().is_usable() {
                match database.connection().reset() {
                    Ok(()) => eprintln!("reconnected"),
                    Err(e) => eprintln!("reconnect failed: {e}"),
                }
            }
        }
    }

    Ok(())
}

fn execute(
    database: &Database,
    ids: &HiLoIdGenerator<Database>,
    cmd: Command,
) -> Result<(), docwire::Error> {
    match cmd {
        Command::Exit => {}
        Command::Ping => {
            database.ping()?;
            println!("ok");
        }
        Command::NextId(collection) => println!("{}", ids.generate_id(&collection)?),
        Command::Insert {
            collection,
            document,
        } => {
            let document = with_id(ids, &collection, document)?;
            let id = document.get("_id").cloned();
            database.collection(&collection).insert_safe(vec![document])?;
            if let Some(id) = id {
                println!("inserted {id}");
            }
        }
        Command::Find { collection, query } => {
            let mut found = 0;
            for doc in database.collection(&collection).find(query)? {
                println!("{}", doc?);
                found += 1;
            }
            println!("({found} documents)");
        }
        Command::Count { collection, query } => {
            println!("{}", database.collection(&collection).count(query)?)
        }
        Command::Remove {
            collection,
            selector,
        } => database.collection(&collection).remove(selector, false)?,
    }
    Ok(())
}

/// Puts a generated `_id` first unless the document already has one.
fn with_id(
    ids: &HiLoIdGenerator<Database>,
    collection: &str,
    document: Document,
) -> Result<Document, docwire::Error> {
    if document.contains_key("_id") {
        return Ok(document);
    }

    let mut with_id = Document::new();
    with_id.insert("_id", ids.generate_id(collection)?);
    for (key, value) in document {
        with_id.insert(key, value);
    }
    Ok(with_id)
}

/// StdOut wrapper than automatically flushes content after every write.
struct StdOut<W: io::Write> {
    inner: W,
}

impl<W: io::Write> io::Write for StdOut<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = self.inner.write(buf);
        if res.is_ok() {
            self.inner.flush()?
        }
        res
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
