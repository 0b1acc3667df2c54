use super::types::StoredItem;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// Scores every candidate against `query` and keeps the best `top_k`.
/// Order: similarity desc, then newer `created_at`, then id.
pub fn rank<'a>(query: &[f32], candidates: &'a [StoredItem], top_k: usize) -> Vec<(&'a StoredItem, f32)> {
    let mut scored: Vec<(&StoredItem, f32)> = candidates
        .iter()
        .filter(|stored| stored.embedding.len() == query.len())
        .map(|stored| (stored, cosine_similarity(query, &stored.embedding)))
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then_with(|| b.item.created_at.cmp(&a.item.created_at))
            .then_with(|| a.item.id.cmp(&b.item.id))
    });
    scored.truncate(top_k);
    scored
}
