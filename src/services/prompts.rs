use crate::core::config::Audience;
use crate::core::state::QaRound;

const JSON_ONLY: &str = "Respond with valid JSON only, with no extra text before or after.";

pub fn story_system_prompt(audience: Audience) -> String {
    let persona = match audience {
        Audience::Kid => {
            "You are an award-winning picture book author and art director writing for \
             children aged 3 to 8. Your stories have a clear beginning, middle and end, \
             read aloud well, and close on a gentle moral. Never include violence, weapons, \
             horror, nudity, substance use, hate or self-harm. If the idea hints at anything \
             unsafe, turn it into a gentle adventure."
        }
        Audience::Adult => {
            "You are an award-winning picture book author and art director. Write \
             family-appropriate stories with richer vocabulary, nuanced characters and a \
             thoughtful structure. Avoid explicit violence, sexual content, substance use \
             and hateful content. If the idea hints at anything unsafe, reinterpret it into \
             a safe, reflective story."
        }
    };
    format!("{}\n{}", persona, JSON_ONLY)
}

pub fn story_user_prompt(concept: &str, page_count: usize) -> String {
    format!(
        r#"Write a {n}-page illustrated storybook about: "{concept}".
Return JSON shaped exactly like this:
{{
  "title": "string",
  "authorLine": "string",
  "moral": "string",
  "characterDescriptions": "One line per character: name - species, colors, clothing, one unique feature",
  "pages": [
    {{ "pageNumber": 1, "text": "2-4 short sentences", "imagePrompt": "Character name, action, setting, mood, colors. No text in the image." }}
  ]
}}
Rules:
- Exactly {n} pages numbered 1 to {n}.
- Every imagePrompt starts with the character's name.
- characterDescriptions lists every character's look, one per line.
- Warm, simple language that is easy to read aloud."#,
        n = page_count,
        concept = concept
    )
}

pub fn qa_system_prompt(audience: Audience) -> String {
    let persona = match audience {
        Audience::Kid => {
            "You are a cheerful story helper chatting with a child. Ask short, exciting \
             questions and offer playful suggested answers full of animals, small magic \
             and silly surprises."
        }
        Audience::Adult => {
            "You are a story development consultant for illustrated books. Ask thoughtful \
             questions about character, world, narrative arc and emotional tone, and offer \
             specific, evocative suggested answers."
        }
    };
    format!("{} Always respond with valid JSON only.", persona)
}

pub fn round_focus(round_number: usize, audience: Audience) -> &'static str {
    match (round_number, audience) {
        (1, Audience::Kid) => {
            "Focus on the CHARACTERS and SETTING: who is the hero, what are they like, and \
             where does the story happen?"
        }
        (1, Audience::Adult) => {
            "Focus on the CHARACTERS and SETTING: the protagonist's personality, motivation \
             and world, and the atmosphere the story should evoke."
        }
        (2, Audience::Kid) => {
            "Focus on the ADVENTURE and CHALLENGE: what problem does the hero face and who \
             helps them?"
        }
        (2, Audience::Adult) => {
            "Focus on the PLOT and CONFLICT: what drives the story, what is at stake, and \
             which turning points arise?"
        }
        (_, Audience::Kid) => {
            "Focus on the ENDING and FEELINGS: how does the story end and how should the \
             reader feel afterwards?"
        }
        (_, Audience::Adult) => {
            "Focus on the TONE and RESOLUTION: which emotional register fits, and what \
             impression should the ending leave?"
        }
    }
}

pub fn qa_user_prompt(
    concept: &str,
    round_number: usize,
    total_rounds: usize,
    previous: &[(String, String)],
    audience: Audience,
) -> String {
    let mut prompt = format!("Story concept: \"{}\"\n\n", concept);

    if !previous.is_empty() {
        prompt.push_str("Answers so far:\n");
        for (question, answer) in previous {
            prompt.push_str(&format!("- Q: {}\n  A: {}\n", question, answer));
        }
        prompt.push('\n');
    }

    let flavour = match audience {
        Audience::Kid => "fun for kids",
        Audience::Adult => "evocative",
    };
    prompt.push_str(&format!(
        r#"This is round {round} of {total}. {focus}

Ask up to 3 questions, each with exactly 3 suggested answers that are specific and {flavour}.
If you already know enough to write a great story, set "done" to true.
Return JSON shaped exactly like this:
{{
  "questions": [
    {{ "question": "Your question?", "suggestions": ["First", "Second", "Third"] }}
  ],
  "done": false
}}"#,
        round = round_number,
        total = total_rounds,
        focus = round_focus(round_number, audience),
        flavour = flavour
    ));
    prompt
}

/// Appends every answered pair, in order, to the original concept.
pub fn compile_enriched_concept(original: &str, rounds: &[QaRound]) -> String {
    let pairs: Vec<(&str, &str)> = rounds.iter().flat_map(|r| r.answered_pairs()).collect();
    if pairs.is_empty() {
        return original.to_string();
    }

    let mut enriched = format!("{}\n\nAdditional story details:\n", original);
    for (question, answer) in pairs {
        enriched.push_str(&format!("- {}: {}\n", question, answer));
    }
    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::QaQuestion;

    fn question(text: &str, answer: Option<&str>) -> QaQuestion {
        QaQuestion {
            text: text.into(),
            suggested_answers: ["a".into(), "b".into(), "c".into()],
            user_answer: answer.map(str::to_string),
        }
    }

    #[test]
    fn test_enriched_concept_keeps_order() {
        let rounds = vec![
            QaRound {
                round_number: 1,
                questions: vec![
                    question("Who is the hero?", Some("A fox")),
                    question("Where?", None),
                ],
                done: false,
            },
            QaRound {
                round_number: 2,
                questions: vec![question("What goes wrong?", Some("Rain"))],
                done: true,
            },
        ];
        assert_eq!(
            compile_enriched_concept("A fox story", &rounds),
            "A fox story\n\nAdditional story details:\n- Who is the hero?: A fox\n- What goes wrong?: Rain\n"
        );
        assert_eq!(compile_enriched_concept("plain", &[]), "plain");
    }

    #[test]
    fn test_round_focus_by_audience() {
        assert!(round_focus(1, Audience::Kid).contains("CHARACTERS and SETTING"));
        assert!(round_focus(2, Audience::Kid).contains("ADVENTURE and CHALLENGE"));
        assert!(round_focus(2, Audience::Adult).contains("PLOT and CONFLICT"));
        assert!(round_focus(4, Audience::Adult).contains("TONE and RESOLUTION"));
        assert!(qa_system_prompt(Audience::Kid).ends_with("valid JSON only."));
    }

    #[test]
    fn test_user_prompt_mentions_page_count() {
        let prompt = story_user_prompt("a shy kitten", 6);
        assert!(prompt.contains("6-page"));
        assert!(prompt.contains("\"imagePrompt\""));
        assert!(story_system_prompt(Audience::Adult).ends_with(JSON_ONLY));
    }
}
