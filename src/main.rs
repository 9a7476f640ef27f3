use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use predsql::ast::{
    col, row_count, Dialect, Node, NodeRef, Operator, Projection, SqlPredicateAdapter, Value,
};
use predsql::db::{
    describe_table, ColumnKind, ConnectionConfig, ConnectionManager, EntityMeta,
    ProviderRegistry, QueryProvider,
};
use std::sync::Arc;

/// Compile predicate queries to dialect SQL and run them
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the SQL and bound parameters for a query
    Compile {
        /// Target dialect (sqlserver, sqlserver-legacy, postgres, mysql)
        #[arg(long, default_value = "sqlserver")]
        dialect: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Execute a query against a saved connection and print rows as JSON
    Run {
        /// Saved connection name
        #[arg(long = "connect")]
        connect: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    /// List saved connections
    Connections,
}

#[derive(Args)]
struct QueryArgs {
    /// Table to query
    #[arg(long)]
    table: String,
    /// Column layout as name:type pairs, e.g. id:int,active:bool
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,
    /// SQL predicate, e.g. "age > 18 AND active = 1"
    #[arg(long)]
    filter: Option<String>,
    #[arg(long, conflicts_with = "order_by_desc")]
    order_by: Option<String>,
    #[arg(long)]
    order_by_desc: Option<String>,
    #[arg(long)]
    skip: Option<u64>,
    #[arg(long)]
    take: Option<u64>,
    /// Return the number of matching rows
    #[arg(long, conflicts_with = "any")]
    count: bool,
    /// Return whether any row matches
    #[arg(long)]
    any: bool,
    /// Project onto these columns
    #[arg(long, value_delimiter = ',')]
    select: Vec<String>,
}

impl QueryArgs {
    fn entity(&self) -> Result<Option<EntityMeta>> {
        if self.columns.is_empty() {
            return Ok(None);
        }
        let mut meta = EntityMeta::new(self.table.as_str());
        for pair in &self.columns {
            let (name, kind) = pair.split_once(':').unwrap_or((pair.as_str(), "text"));
            if name.is_empty() {
                bail!("empty column name in --columns {:?}", pair);
            }
            meta = meta.column(name, ColumnKind::from_sql_type(kind));
        }
        Ok(Some(meta))
    }

    fn root(&self, dialect: Dialect) -> Result<NodeRef> {
        let mut root: NodeRef = Arc::new(Node::Source);
        let mut chain = |op: Operator, arg: NodeRef| {
            root = Node::call(op, vec![root.clone(), arg]);
        };

        if let Some(text) = &self.filter {
            let predicate = SqlPredicateAdapter::new(dialect)
                .parse(text)
                .with_context(|| format!("invalid --filter {:?}", text))?;
            chain(Operator::Where, predicate.into_lambda());
        }
        if let Some(column) = &self.order_by {
            chain(Operator::OrderBy, col(column.as_str()).into_lambda());
        }
        if let Some(column) = &self.order_by_desc {
            chain(Operator::OrderByDescending, col(column.as_str()).into_lambda());
        }
        if let Some(n) = self.skip {
            chain(Operator::Skip, row_count(n).into_node());
        }
        if let Some(n) = self.take {
            chain(Operator::Take, row_count(n).into_node());
        }
        match self.select.as_slice() {
            [] => {}
            [column] => chain(
                Operator::Select,
                Projection::column(column.as_str()).into_lambda(),
            ),
            columns => chain(
                Operator::Select,
                Projection::columns(columns.iter().cloned()).into_lambda(),
            ),
        }

        Ok(if self.count {
            Node::call(Operator::Count, vec![root])
        } else if self.any {
            Node::call(Operator::Any, vec![root])
        } else {
            root
        })
    }
}

fn params_json(params: &[Value]) -> serde_json::Value {
    serde_json::Value::Array(params.iter().map(Value::to_json).collect())
}

fn compile(dialect: &str, args: &QueryArgs) -> Result<()> {
    let dialect = Dialect::from_provider(dialect)?;
    let meta = args
        .entity()?
        .unwrap_or_else(|| EntityMeta::new(args.table.as_str()));
    let root = args.root(dialect)?;
    let query = predsql::ast::Converter::new(dialect, &meta).compile(&root)?;

    println!("{}", query.sql);
    println!("{}", params_json(&query.params));
    Ok(())
}

fn resolve_password(config: &mut ConnectionConfig) -> Result<()> {
    if !config.password.is_empty() {
        return Ok(());
    }
    if let Ok(pw) = std::env::var("PGPASSWORD") {
        config.password = pw;
    } else {
        let prompt = format!("Password for {}: ", config.display_string());
        config.password = rpassword::read_password_from_tty(Some(&prompt))?;
    }
    Ok(())
}

fn run(name: &str, args: &QueryArgs) -> Result<()> {
    let mut config = ConnectionManager::find(name)?;
    resolve_password(&mut config)?;

    let mut connection = ProviderRegistry::default().connect(&config)?;
    let meta = match args.entity()? {
        Some(meta) => meta,
        None => describe_table(connection.as_mut(), &args.table)
            .with_context(|| format!("Failed to describe table {}", args.table))?,
    };

    let provider = QueryProvider::new(connection);
    let root = args.root(provider.dialect())?;
    let query = provider.compile(&meta, &root)?;
    let result = provider.run(&query)?;
    provider.close()?;

    let output = if args.any {
        serde_json::Value::Bool(!result.rows.is_empty())
    } else if args.count {
        result.scalar().map(Value::to_json).unwrap_or(serde_json::Value::Null)
    } else {
        serde_json::Value::Array(
            result
                .records(&meta)
                .into_iter()
                .map(serde_json::Value::Object)
                .collect(),
        )
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    eprintln!(
        "{} row(s) in {:.1?}",
        result.row_count(),
        result.execution_time
    );
    Ok(())
}

fn list_connections() -> Result<()> {
    let saved = ConnectionManager::load_saved_connections()?;
    if saved.is_empty() {
        eprintln!(
            "No saved connections in {}",
            ConnectionManager::get_config_path().display()
        );
    }
    for c in saved {
        println!("{}\t{}\t{}", c.name, c.provider, c.display_string());
    }
    Ok(())
}

fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Compile { dialect, query } => compile(dialect, query),
        Command::Run { connect, query } => run(connect, query),
        Command::Connections => list_connections(),
    }
}
