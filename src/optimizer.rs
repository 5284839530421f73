/// Plain stochastic gradient descent, `w -= lr * dw`. No momentum, no decay.
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }

    pub fn step(&self, weights: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(weights.len(), grads.len());
        for (w, g) in weights.iter_mut().zip(grads.iter()) {
            *w -= self.learning_rate * g;
        }
    }
}
