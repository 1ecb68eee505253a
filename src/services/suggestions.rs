use rand::seq::IndexedRandom;

const CONCEPT_POOL: [&str; 8] = [
    "A curious fox who starts a little lending library in the park",
    "A shy kitten trying to make friends on the first day of school",
    "A clumsy puppy learning to fetch at the neighborhood dog park",
    "A little rabbit growing the biggest carrot in the garden",
    "A brave duckling swimming across the pond for the first time",
    "An otter who teaches her younger brother how to share",
    "A baby bear helping grandma bake a birthday cake",
    "A small owl staying up past bedtime to count the stars",
];

/// Up to `count` distinct story ideas, in random order.
pub fn random_concepts(count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    CONCEPT_POOL
        .choose_multiple(&mut rng, count)
        .map(|c| c.to_string())
        .collect()
}
