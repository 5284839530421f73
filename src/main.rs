use std::fs;
use std::io::Write;
use std::path::Path;

use rand::prelude::*;

use attogpt::checkpoint;
use attogpt::config::Config;
use attogpt::device::Device;
use attogpt::model::GptModel;
use attogpt::trainer::Trainer;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Optional GPU vendor substring, e.g. `attogpt NVIDIA`.
    let preference = std::env::args().nth(1);
    let device = Device::new(preference.as_deref());

    // Byte-level token ids; a real tokenizer plugs in here.
    let dataset = fs::read("dataset.txt")?;
    let tokens: Vec<usize> = dataset.iter().map(|b| *b as usize).collect();

    let config = Config {
        vocab_size: 256,
        d_model: 64,
        num_heads: 8,
        num_layers: 4,
        context_size: 64,
        learning_rate: 0.001,
        device_preference: preference.clone(),
    };
    if tokens.len() <= config.context_size {
        return Err(format!(
            "dataset.txt has {} tokens, need more than the context size of {}",
            tokens.len(),
            config.context_size
        )
        .into());
    }
    println!(
        "Backend: {}",
        if device.is_gpu() { "GPU" } else { "CPU" }
    );

    let model_path = "model.bin";
    let mut rng = rand::thread_rng();
    let mut model = if Path::new(model_path).is_file() {
        println!("Resuming from {}...", model_path);
        checkpoint::load_file(model_path)?
    } else {
        GptModel::new(&mut rng, config.clone())
    };
    println!("Number of parameters: {}", model.num_params());

    let trainer = Trainer::new(config.learning_rate, false);
    let batch_size = 16;
    let steps = 10000;

    for step in 0..steps {
        let batch: Vec<Vec<usize>> = (0..batch_size)
            .map(|_| {
                let start = rng.gen_range(0..tokens.len() - config.context_size);
                tokens[start..start + config.context_size].to_vec()
            })
            .collect();
        let loss = trainer.train_batch(&device, &mut model, &batch)?;
        println!("Step: {} Loss: {}", step, loss);

        if step % 50 == 0 {
            checkpoint::save_file(&model, model_path)?;

            let prompt = vec![tokens[0]];
            let generated = model.generate(&device, &mut rng, &prompt, 100, 0.8)?;
            let bytes: Vec<u8> = generated.iter().map(|t| *t as u8).collect();
            println!("{}", String::from_utf8_lossy(&bytes));
            std::io::stdout().flush()?;
        }
    }

    checkpoint::save_file(&model, model_path)?;
    Ok(())
}
