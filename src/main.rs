use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storyfox::core::config::{Audience, Config, CONCEPT_MAX_LENGTH};
use storyfox::core::credentials::EnvCredentialStore;
use storyfox::core::safety::BasicSafetyGate;
use storyfox::core::state::{QaRound, Story};
use storyfox::services::llm::local::ModelCache;
use storyfox::services::progress::{self, ProgressEvent};
use storyfox::services::qa::{QaSession, QaStep};
use storyfox::services::router::Router;
use storyfox::services::session::{GenerationSession, SessionOutcome};
use storyfox::services::suggestions::random_concepts;
use tokio_util::sync::CancellationToken;

const TYPE_OWN: &str = "Type my own answer";
const SKIP: &str = "Skip this question";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists. An empty file uses the defaults.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let credentials = Arc::new(EnvCredentialStore::new(config.credentials.clone()));
    let router = Arc::new(Router::from_config(
        &config,
        credentials,
        Arc::new(ModelCache::new()),
    ));
    println!("Story drafting with the {}.", router.primary_name());

    let concept = ask_concept()?;
    let ask_questions = Confirm::new("Answer a few questions to shape the story?")
        .with_default(true)
        .prompt()?;
    let (concept, enriched) = if ask_questions {
        match run_questions(router.clone(), &concept, config.text.audience).await {
            Ok(enriched) => {
                let changed = enriched != concept;
                (enriched, changed)
            }
            Err(e) => {
                eprintln!("{}", e);
                println!("Continuing with the original idea.");
                (concept, false)
            }
        }
    } else {
        (concept, false)
    };

    let session = Arc::new(GenerationSession::from_config(
        router,
        Arc::new(BasicSafetyGate),
        &config.text,
    ));
    let outcome = generate_with_spinner(session, &concept, config.text.page_count, enriched).await?;

    match outcome {
        SessionOutcome::Completed(story) => {
            print_story(&story);
            let path = save_story(Path::new(&config.output_folder), &story)?;
            println!("Saved to {}", path.display());
        }
        SessionOutcome::Failed(message) => eprintln!("{}", message),
        SessionOutcome::Cancelled => println!("Generation cancelled."),
    }

    Ok(())
}

fn ask_concept() -> Result<String> {
    let idea = random_concepts(1).pop().unwrap_or_default();
    let help = format!("Up to {} characters. Press Enter for the suggestion.", CONCEPT_MAX_LENGTH);
    let concept = Text::new("What should the story be about?")
        .with_default(&idea)
        .with_help_message(&help)
        .prompt()?;
    Ok(concept)
}

async fn run_questions(router: Arc<Router>, concept: &str, audience: Audience) -> Result<String> {
    let mut session = QaSession::new(router, concept, audience);
    let cancel = CancellationToken::new();
    println!("Thinking of questions...");
    let mut step = session.start(&cancel).await?;

    loop {
        let round = match step {
            QaStep::Complete(enriched) => return Ok(enriched),
            QaStep::Round(round) => round,
        };

        loop {
            ask_round(&mut session, &round)?;
            if session.can_proceed() {
                break;
            }
            println!("Answer at least one question to continue.");
        }

        let more = !round.done
            && Confirm::new("Keep going with more questions?")
                .with_default(true)
                .prompt()?;
        step = if more {
            println!("Thinking of more questions...");
            session.submit_round(&cancel).await?
        } else {
            QaStep::Complete(session.finish_early()?)
        };
    }
}

fn ask_round(session: &mut QaSession, round: &QaRound) -> Result<()> {
    println!("\nRound {}", round.round_number);
    for (index, question) in round.questions.iter().enumerate() {
        let mut options: Vec<&str> = question
            .suggested_answers
            .iter()
            .map(String::as_str)
            .collect();
        options.push(TYPE_OWN);
        options.push(SKIP);

        let answer = match Select::new(&question.text, options).prompt()? {
            TYPE_OWN => Text::new("Your answer:").prompt()?,
            SKIP => continue,
            choice => choice.to_string(),
        };
        session.answer(index, &answer);
    }
    Ok(())
}

async fn generate_with_spinner(
    session: Arc<GenerationSession>,
    concept: &str,
    page_count: usize,
    enriched: bool,
) -> Result<SessionOutcome> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Starting...");

    let (sink, mut events) = progress::channel();
    let reporter = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProgressEvent::Partial(text) => pb.set_message(format!(
                        "Writing... {} words so far",
                        text.split_whitespace().count()
                    )),
                    other => pb.set_message(other.to_string()),
                }
            }
        })
    };
    let interrupt = {
        let session = session.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                session.cancel();
            }
        })
    };

    let outcome = session.generate(concept, page_count, enriched, &sink).await;
    interrupt.abort();
    drop(sink);
    let _ = reporter.await;

    match &outcome {
        SessionOutcome::Completed(_) => pb.finish_with_message("Story ready"),
        SessionOutcome::Failed(_) => pb.abandon_with_message("Generation failed"),
        SessionOutcome::Cancelled => pb.finish_and_clear(),
    }
    Ok(outcome)
}

fn print_story(story: &Story) {
    println!("\n{}", story.title);
    println!("{}\n", story.author_line);
    for page in &story.pages {
        println!("Page {}", page.page_number);
        println!("{}", page.text);
        println!("  [illustration: {}]\n", page.illustration_prompt);
    }
    println!("Moral: {}", story.moral);
    if !story.characters.is_empty() {
        println!("\nCharacters:");
        for character in &story.characters {
            println!("- {}: {}", character.name, character.attributes.join(", "));
        }
    }
}

fn save_story(folder: &Path, story: &Story) -> Result<PathBuf> {
    let mut slug: String = story
        .title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-');
    let name = if slug.is_empty() { "story" } else { slug };

    let path = folder.join(format!("{}.json", name));
    fs::write(&path, serde_json::to_string_pretty(story)?)?;
    Ok(path)
}
