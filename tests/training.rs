use rand::rngs::StdRng;
use rand::SeedableRng;

use attogpt::checkpoint;
use attogpt::config::Config;
use attogpt::device::Device;
use attogpt::model::GptModel;
use attogpt::trainer::Trainer;

fn small_config() -> Config {
    Config {
        vocab_size: 8,
        d_model: 16,
        num_heads: 2,
        num_layers: 2,
        context_size: 20,
        learning_rate: 0.01,
        device_preference: None,
    }
}

#[test]
fn training_decreases_loss_on_repeating_sequence() {
    let device = Device::cpu();
    let mut rng = StdRng::seed_from_u64(1234);
    let mut model = GptModel::new(&mut rng, small_config());
    let trainer = Trainer::new(0.01, false);

    // A fixed 20-token cycle; the model should memorize the successor of
    // every token.
    let sequence: Vec<usize> = (0..20).map(|i| i % 5).collect();
    let batch = vec![sequence];

    let first = trainer.train_batch(&device, &mut model, &batch).unwrap();
    let mut last = first;
    for _ in 1..50 {
        last = trainer.train_batch(&device, &mut model, &batch).unwrap();
    }
    assert!(
        last < first,
        "loss did not decrease: first {} last {}",
        first,
        last
    );
}

#[test]
fn trained_weights_survive_a_checkpoint_round_trip() {
    let device = Device::cpu();
    let mut rng = StdRng::seed_from_u64(99);
    let mut model = GptModel::new(&mut rng, small_config());
    let trainer = Trainer::new(0.01, false);
    let batch = vec![(0..20).map(|i| (i * 3) % 8).collect::<Vec<usize>>()];
    for _ in 0..5 {
        trainer.train_batch(&device, &mut model, &batch).unwrap();
    }

    let mut buf = Vec::new();
    checkpoint::save(&model, &mut buf).unwrap();
    let loaded = checkpoint::load(&mut buf.as_slice()).unwrap();

    // Identical weights produce identical logits.
    let context = &[1usize, 2, 3, 4];
    let a = model.forward(&device, context).unwrap();
    let b = loaded.forward(&device, context).unwrap();
    assert_eq!(a, b);
}

#[test]
fn logits_cover_the_vocabulary_for_every_position() {
    let device = Device::cpu();
    let mut rng = StdRng::seed_from_u64(7);
    let model = GptModel::new(&mut rng, small_config());
    let logits = model.forward(&device, &[0, 1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(logits.shape(), &[7, 8]);
    assert!(logits.blob().iter().all(|v| v.is_finite()));
}
