use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

use gpt_forward::{
    text_to_token_ids, token_batch, ForwardContext, GptConfig, GptModel, Gpt2Tokenizer, NormalInit,
    NumericPolicy,
};

/// Runs one forward pass of a randomly initialized GPT model and reports the output shapes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// JSON model configuration. Defaults to the small demo configuration.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,
    /// Input text; requires --tokenizer.
    #[clap(long, value_parser, conflicts_with = "ids")]
    text: Option<String>,
    /// Serialized tokenizer.json.
    #[clap(long, value_parser)]
    tokenizer: Option<PathBuf>,
    /// Comma separated token ids, e.g. 18438,502,703
    #[clap(long, value_parser, value_delimiter = ',')]
    ids: Vec<u32>,
    /// Seed for parameter initialization and dropout.
    #[clap(long, value_parser, default_value_t = 123)]
    seed: u64,
    /// Apply dropout as in training mode.
    #[clap(long)]
    dropout: bool,
    /// Fail on NaN or infinity in intermediate tensors.
    #[clap(long)]
    strict: bool,
}

fn run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => GptConfig::load(path.to_str().ok_or("config path is not valid UTF-8")?)?,
        None => GptConfig::demo(),
    };

    let input_ids = match (&args.text, &args.tokenizer) {
        (Some(text), Some(tokenizer_path)) => {
            let tokenizer = Gpt2Tokenizer::from_file(tokenizer_path)?;
            println!("Input text: \"{}\"", text);
            text_to_token_ids(text, &tokenizer)?
        }
        (Some(_), None) => return Err("--text requires --tokenizer".into()),
        (None, _) if !args.ids.is_empty() => token_batch(&[args.ids.clone()])?,
        (None, _) => return Err("provide either --text with --tokenizer, or --ids".into()),
    };
    println!("Token ids: {:?}", input_ids.row(0).to_vec());

    let model = GptModel::new(&config, &mut NormalInit::gpt2(args.seed)?)?;
    println!("Model parameters: {}", model.parameter_count());

    let ctx = if args.dropout {
        ForwardContext::training(args.seed)
    } else {
        ForwardContext::inference()
    };
    let policy = if args.strict { NumericPolicy::Strict } else { NumericPolicy::Warn };
    let mut ctx = ctx.numeric_policy(policy);

    let output = model.forward(&input_ids, &mut ctx)?;
    println!("Pre-stack embedding shape: {:?}", output.pre_stack.shape());
    println!("Post-stack hidden state shape: {:?}", output.post_stack.shape());
    println!("Logits shape: {:?}", output.logits.shape());
    println!("Predicted next token ids: {:?}", output.next_token_ids()?);
    Ok(())
}

fn main() {
    let args = CliArgs::parse();
    if let Err(e) = run(args) {
        eprintln!("Application error: {}", e);
        let mut current_err: Option<&(dyn Error + 'static)> = e.source();
        while let Some(source) = current_err {
            eprintln!("Caused by: {}", source);
            current_err = source.source();
        }
        std::process::exit(1);
    }
}
