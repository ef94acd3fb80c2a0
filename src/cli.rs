use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file
    #[clap(short, long, default_value = "config.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct DatabaseArgs {
    /// Directory holding the persisted vector database
    #[clap(long, default_value = "./vector_database")]
    pub database_dir: String,

    /// Cache directory for downloaded encoder models
    #[clap(long, default_value = ".")]
    pub model_dir: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Text passages only
    Text,
    /// Images only (text-to-image)
    Image,
    /// Fused text and image results
    Multimodal,
    /// Length-budgeted context for answer generation
    Rag,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the vector database from a structured knowledge export
    Build {
        /// Directory with content.json, image.json and an images/ folder
        #[clap(long, default_value = "./knowledge")]
        data_dir: String,

        #[command(flatten)]
        database: DatabaseArgs,
    },

    /// Query the knowledge base with text
    Search {
        /// Query text
        #[clap(short, long)]
        query: String,

        #[clap(short, long, value_enum, default_value = "multimodal")]
        mode: SearchMode,

        /// Number of results to return
        #[clap(short, long, default_value = "5")]
        top_k: usize,

        /// Override the configured similarity threshold
        #[clap(long)]
        min_score: Option<f32>,

        /// Write results to a JSON file instead of stdout
        #[clap(short, long)]
        output: Option<String>,

        #[command(flatten)]
        database: DatabaseArgs,
    },

    /// Query the knowledge base with an image file
    SearchImage {
        /// Path to the query image
        #[clap(short, long)]
        image: String,

        /// Number of results to return
        #[clap(short, long, default_value = "5")]
        top_k: usize,

        /// Override the configured similarity threshold
        #[clap(long)]
        min_score: Option<f32>,

        #[command(flatten)]
        database: DatabaseArgs,
    },

    /// Run the HTTP API
    Serve {
        /// Address to bind, overriding the config file
        #[clap(long)]
        listen: Option<String>,

        /// Knowledge image directory to serve under /images
        #[clap(long)]
        image_dir: Option<String>,

        #[command(flatten)]
        database: DatabaseArgs,
    },
}
