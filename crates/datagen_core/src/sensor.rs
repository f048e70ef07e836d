//! Modelo de sensor simulado – random walk de temperatura/umidade.
//!
//! Gera leituras que mudam devagar (sem saltos aleatórios), com uma
//! anomalia rara de ±20°C e uma correlação frouxa entre as duas grandezas:
//! temperatura mais baixa puxa a umidade para cima.
//!
//! Toda a aleatoriedade passa por [`SensorDraws`], então os testes conseguem
//! roteirizar cada sorteio.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Faixa válida de temperatura (°C).
pub const TEMPERATURE_MIN: f64 = -20.0;
pub const TEMPERATURE_MAX: f64 = 45.0;

/// Faixa válida de umidade relativa (%).
pub const HUMIDITY_MIN: i32 = 0;
pub const HUMIDITY_MAX: i32 = 100;

/// Uma anomalia a cada ~500 leituras (~0,2%).
const ANOMALY_ODDS: u32 = 500;
const ANOMALY_JUMP: f64 = 20.0;
const MAX_DRIFT: f64 = 0.5;
const MAX_HUMIDITY_NOISE: i32 = 10;

/// Última leitura persistida pelo modelo.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorState {
    pub last_temperature: f64,
    pub last_humidity: i32,
}

/// Par (temperatura, umidade) devolvido a cada passo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: i32,
}

/// Fonte dos sorteios usados em um passo do random walk.
pub trait SensorDraws {
    /// Inteiro uniforme em `[0, 500)`; zero dispara a anomalia.
    fn anomaly_roll(&mut self) -> u32;
    /// Direção da anomalia: `true` soma 20°C, `false` subtrai.
    fn anomaly_rises(&mut self) -> bool;
    /// Deriva uniforme em `[-0.5, 0.5)`.
    fn drift(&mut self) -> f64;
    /// Ruído inteiro uniforme em `[-10, 10]`.
    fn humidity_noise(&mut self) -> i32;
    /// Re-sorteio abaixo da faixa: `[0, 20)`.
    fn resample_low(&mut self) -> i32;
    /// Re-sorteio acima da faixa: `[90, 100]`.
    fn resample_high(&mut self) -> i32;
}

impl<R: RngCore> SensorDraws for R {
    fn anomaly_roll(&mut self) -> u32 {
        self.gen_range(0..ANOMALY_ODDS)
    }

    fn anomaly_rises(&mut self) -> bool {
        self.gen_bool(0.5)
    }

    fn drift(&mut self) -> f64 {
        self.gen_range(-MAX_DRIFT..MAX_DRIFT)
    }

    fn humidity_noise(&mut self) -> i32 {
        self.gen_range(-MAX_HUMIDITY_NOISE..=MAX_HUMIDITY_NOISE)
    }

    fn resample_low(&mut self) -> i32 {
        self.gen_range(0..20)
    }

    fn resample_high(&mut self) -> i32 {
        self.gen_range(90..=HUMIDITY_MAX)
    }
}

/// Gerador com estado próprio; um único dono (o loop de emissão).
pub struct SensorModel<D = StdRng> {
    state: SensorState,
    draws: D,
}

impl SensorModel<StdRng> {
    /// Modelo com semente vinda do sistema operacional.
    pub fn from_entropy() -> Self {
        Self::with_draws(SensorState::default(), StdRng::from_entropy())
    }

    /// Modelo determinístico para uma semente fixa.
    pub fn seeded(seed: u64) -> Self {
        Self::with_draws(SensorState::default(), StdRng::seed_from_u64(seed))
    }
}

impl<D: SensorDraws> SensorModel<D> {
    pub fn with_draws(state: SensorState, draws: D) -> Self {
        Self { state, draws }
    }

    pub fn state(&self) -> SensorState {
        self.state
    }

    /// Avança um passo e devolve a nova leitura.
    pub fn next(&mut self) -> Reading {
        let temperature = self.next_temperature();
        let humidity = self.next_humidity(temperature);

        self.state = SensorState {
            last_temperature: temperature,
            last_humidity: humidity,
        };

        Reading {
            temperature,
            humidity,
        }
    }

    fn next_temperature(&mut self) -> f64 {
        let mut temperature = self.state.last_temperature;

        if self.draws.anomaly_roll() == 0 {
            temperature += if self.draws.anomaly_rises() {
                ANOMALY_JUMP
            } else {
                -ANOMALY_JUMP
            };
        } else {
            temperature += self.draws.drift();
        }

        temperature.clamp(TEMPERATURE_MIN, TEMPERATURE_MAX)
    }

    fn next_humidity(&mut self, temperature: f64) -> i32 {
        let baseline = humidity_baseline(temperature, self.state.last_humidity);
        let humidity = baseline + self.draws.humidity_noise();

        // Re-sorteia em vez de saturar: evita a leitura "grudar" na borda
        if humidity < HUMIDITY_MIN {
            self.draws.resample_low()
        } else if humidity > HUMIDITY_MAX {
            self.draws.resample_high()
        } else {
            humidity
        }
    }
}

/// Ajusta o piso/teto da umidade conforme a temperatura, antes do ruído.
pub fn humidity_baseline(temperature: f64, humidity: i32) -> i32 {
    if temperature < 5.0 && humidity < 70 {
        80
    } else if (5.0..25.0).contains(&temperature) && humidity < 50 {
        60
    } else if temperature >= 25.0 && humidity > 40 {
        30
    } else {
        humidity
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
