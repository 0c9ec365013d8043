#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bank_client_lib::{ClientArgs, ClientConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub const ANA: &str = "0000000001";
pub const LUIS: &str = "0000000002";
pub const ADMIN: &str = "1350509525";

struct Account {
    given_names: String,
    family_names: String,
    balance: f64,
    /// Newest first, as the bridge returns it.
    history: Vec<Value>,
}

#[derive(Debug, Clone)]
enum PushCommand {
    Frame(String),
    Kick,
}

struct BridgeInner {
    accounts: Mutex<HashMap<String, Account>>,
    requests: AtomicUsize,
    ws_connections: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
    echo_balance: AtomicBool,
    simulation_batches: AtomicBool,
    clock: AtomicUsize,
    push: broadcast::Sender<PushCommand>,
}

/// In-process stand-in for the bank bridge: HTTP pull routes under `/api`,
/// `/health` at the origin and a WebSocket push route at `/ws`.
#[derive(Clone)]
pub struct FakeBridge {
    inner: Arc<BridgeInner>,
    pub addr: SocketAddr,
}

fn transaction(kind: &str, amount: f64, after: f64, at: &str) -> Value {
    json!({ "tipo": kind, "monto": amount, "saldo_final": after, "fecha": at })
}

pub fn seeded_history() -> Vec<Value> {
    vec![
        transaction("DEPOSITO", 20.0, 100.0, "2024-05-01 11:00:00"),
        transaction("RETIRO", 20.0, 80.0, "2024-05-01 10:00:00"),
        transaction("DEPOSITO", 100.0, 100.0, "2024-05-01 09:00:00"),
    ]
}

impl FakeBridge {
    pub async fn start() -> Self {
        let (push, _) = broadcast::channel(64);
        let mut accounts = HashMap::new();
        accounts.insert(
            ANA.to_string(),
            Account {
                given_names: "Ana".to_string(),
                family_names: "Torres".to_string(),
                balance: 100.0,
                history: seeded_history(),
            },
        );
        accounts.insert(
            LUIS.to_string(),
            Account {
                given_names: "Luis".to_string(),
                family_names: "Mena".to_string(),
                balance: 40.0,
                history: Vec::new(),
            },
        );
        accounts.insert(
            ADMIN.to_string(),
            Account {
                given_names: "Admin".to_string(),
                family_names: String::new(),
                balance: 0.0,
                history: Vec::new(),
            },
        );

        let inner = Arc::new(BridgeInner {
            accounts: Mutex::new(accounts),
            requests: AtomicUsize::new(0),
            ws_connections: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            echo_balance: AtomicBool::new(true),
            simulation_batches: AtomicBool::new(false),
            clock: AtomicUsize::new(0),
            push,
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("fake bridge should bind");
        let addr = listener.local_addr().expect("fake bridge address");
        let bridge = Self { inner, addr };

        let router = Router::new()
            .route("/health", get(health))
            .route("/ws", get(push_socket))
            .route("/api/consulta", post(consulta))
            .route("/api/deposito", post(deposito))
            .route("/api/retiro", post(retiro))
            .route("/api/transferir", post(transferir))
            .route("/api/cliente", post(cliente))
            .route("/api/historial/:cedula", get(historial))
            .route("/api/stats", get(stats))
            .route("/api/simulate", post(simulate))
            .with_state(bridge.clone());

        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        bridge
    }

    pub fn config(&self, confirmation_grace_ms: u64) -> ClientConfig {
        ClientArgs {
            api_base_url: Some(format!("http://{}/api", self.addr)),
            push_url: Some(format!("ws://{}/ws", self.addr)),
            reconnect_delay_ms: Some(20),
            reconnect_attempts: Some(5),
            confirmation_grace_ms: Some(confirmation_grace_ms),
            ..ClientArgs::default()
        }
        .normalize()
        .expect("fake bridge config should be valid")
    }

    /// Stops the bridge from announcing balance changes on its own.
    pub fn silence_balance_echo(&self) {
        self.inner.echo_balance.store(false, Ordering::SeqCst);
    }

    /// Answers `/simulate` with a full operation batch instead of the bridge's
    /// plain acknowledgement.
    pub fn serve_simulation_batches(&self) {
        self.inner.simulation_batches.store(true, Ordering::SeqCst);
    }

    pub fn broadcast(&self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        let _ = self.inner.push.send(PushCommand::Frame(frame));
    }

    pub fn broadcast_raw(&self, frame: &str) {
        let _ = self.inner.push.send(PushCommand::Frame(frame.to_string()));
    }

    pub fn kick_push_clients(&self) {
        let _ = self.inner.push.send(PushCommand::Kick);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn ws_connections(&self) -> usize {
        self.inner.ws_connections.load(Ordering::SeqCst)
    }

    fn next_timestamp(&self) -> String {
        let tick = self.inner.clock.fetch_add(1, Ordering::SeqCst);
        format!("2024-05-02 10:{:02}:{:02}", (tick / 60) % 60, tick % 60)
    }

    fn announce_balance(&self, cedula: &str, balance: f64) {
        if self.inner.echo_balance.load(Ordering::SeqCst) {
            self.broadcast(
                "balance_updated",
                json!({ "cedula": cedula, "balance": balance }),
            );
        }
    }

    fn record_frame(&self, text: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(text) else {
            return;
        };
        if frame["event"] == "subscribe_balance" {
            if let Some(cedula) = frame["data"]["cedula"].as_str() {
                self.inner.subscriptions.lock().push(cedula.to_string());
            }
        }
    }
}

type Reply = (StatusCode, Json<Value>);

fn rejected(status: StatusCode, error: &str) -> Reply {
    (status, Json(json!({ "success": false, "error": error })))
}

fn ok(data: Value) -> Reply {
    (StatusCode::OK, Json(json!({ "success": true, "data": data })))
}

fn field<'a>(body: &'a Value, name: &str) -> Option<&'a str> {
    body[name].as_str()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "bridge", "timestamp": "2024-05-01T10:00:00" }))
}

async fn consulta(State(bridge): State<FakeBridge>, Json(body): Json<Value>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let accounts = bridge.inner.accounts.lock();
    match field(&body, "cedula").and_then(|cedula| accounts.get(cedula)) {
        Some(account) => ok(json!({
            "nombres": account.given_names,
            "apellidos": account.family_names,
            "saldo": account.balance,
        })),
        None => rejected(StatusCode::NOT_FOUND, "Cliente no encontrado"),
    }
}

async fn deposito(State(bridge): State<FakeBridge>, Json(body): Json<Value>) -> Reply {
    mutate(bridge, body, "DEPOSITO").await
}

async fn retiro(State(bridge): State<FakeBridge>, Json(body): Json<Value>) -> Reply {
    mutate(bridge, body, "RETIRO").await
}

async fn mutate(bridge: FakeBridge, body: Value, kind: &str) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let Some(cedula) = field(&body, "cedula").map(str::to_string) else {
        return rejected(StatusCode::BAD_REQUEST, "Cédula y monto requeridos");
    };
    let amount = body["monto"].as_f64().unwrap_or(0.0);
    if amount <= 0.0 {
        return rejected(StatusCode::BAD_REQUEST, "El monto debe ser positivo");
    }

    let at = bridge.next_timestamp();
    let balance = {
        let mut accounts = bridge.inner.accounts.lock();
        let Some(account) = accounts.get_mut(&cedula) else {
            return rejected(StatusCode::NOT_FOUND, "Cliente no encontrado");
        };
        if kind == "RETIRO" && amount > account.balance {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "Saldo insuficiente",
                    "detalles": format!("saldo actual {:.2}", account.balance),
                })),
            );
        }
        account.balance += if kind == "RETIRO" { -amount } else { amount };
        let balance = account.balance;
        account.history.insert(0, transaction(kind, amount, balance, &at));
        account.history.truncate(10);
        balance
    };

    bridge.announce_balance(&cedula, balance);
    let mensaje = if kind == "RETIRO" {
        "Retiro exitoso"
    } else {
        "Depósito exitoso"
    };
    ok(json!({ "nuevo_saldo": balance, "mensaje": mensaje }))
}

async fn transferir(State(bridge): State<FakeBridge>, Json(body): Json<Value>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let (Some(from), Some(to), Some(amount)) = (
        field(&body, "cedula_origen").map(str::to_string),
        field(&body, "cedula_destino").map(str::to_string),
        body["monto"].as_f64(),
    ) else {
        return rejected(
            StatusCode::BAD_REQUEST,
            "Cédula origen, destino y monto requeridos",
        );
    };

    let (from_balance, to_balance) = {
        let mut accounts = bridge.inner.accounts.lock();
        let Some(origin) = accounts.get(&from).map(|account| account.balance) else {
            return rejected(StatusCode::NOT_FOUND, "Cliente origen no encontrado");
        };
        if !accounts.contains_key(&to) {
            return rejected(StatusCode::NOT_FOUND, "Cliente destino no encontrado");
        }
        if amount > origin {
            return rejected(StatusCode::BAD_REQUEST, "Saldo insuficiente");
        }
        let mut balances = (0.0, 0.0);
        if let Some(account) = accounts.get_mut(&from) {
            account.balance -= amount;
            balances.0 = account.balance;
        }
        if let Some(account) = accounts.get_mut(&to) {
            account.balance += amount;
            balances.1 = account.balance;
        }
        balances
    };

    bridge.announce_balance(&from, from_balance);
    bridge.announce_balance(&to, to_balance);
    ok(json!({
        "mensaje": "Transferencia exitosa",
        "saldo_origen": from_balance,
        "saldo_destino": to_balance,
    }))
}

async fn cliente(State(bridge): State<FakeBridge>, Json(body): Json<Value>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let Some(cedula) = field(&body, "cedula").map(str::to_string) else {
        return rejected(StatusCode::BAD_REQUEST, "Cédula requerida");
    };
    let mut accounts = bridge.inner.accounts.lock();
    if accounts.contains_key(&cedula) {
        return rejected(StatusCode::BAD_REQUEST, "Cliente ya existe");
    }
    let account = Account {
        given_names: field(&body, "nombres").unwrap_or_default().to_string(),
        family_names: field(&body, "apellidos").unwrap_or_default().to_string(),
        balance: body["saldo"].as_f64().unwrap_or(0.0),
        history: Vec::new(),
    };
    let reply = json!({
        "success": true,
        "action": "crear",
        "data": {
            "mensaje": "Cliente creado exitosamente",
            "nombres": account.given_names,
            "apellidos": account.family_names,
            "saldo_inicial": account.balance,
        }
    });
    accounts.insert(cedula, account);
    (StatusCode::OK, Json(reply))
}

async fn historial(State(bridge): State<FakeBridge>, Path(cedula): Path<String>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let accounts = bridge.inner.accounts.lock();
    match accounts.get(&cedula) {
        Some(account) => ok(json!({ "transacciones": account.history })),
        None => rejected(StatusCode::NOT_FOUND, "Cliente no encontrado"),
    }
}

async fn stats(State(bridge): State<FakeBridge>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    let connections = bridge.ws_connections();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "action": "stats",
            "estadisticas": {
                "clientes_activos": 3,
                "operaciones_simultaneas": 1,
                "conexiones_activas": connections,
            }
        })),
    )
}

async fn simulate(State(bridge): State<FakeBridge>) -> Reply {
    bridge.inner.requests.fetch_add(1, Ordering::SeqCst);
    if !bridge.inner.simulation_batches.load(Ordering::SeqCst) {
        return (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Pruebas de concurrencia iniciadas. Se ha abierto una nueva consola con los tests.",
            })),
        );
    }
    let operations: Vec<Value> = (0..8)
        .map(|index| {
            json!({
                "thread": format!("Thread-{index}"),
                "cedula": if index % 2 == 0 { ANA } else { LUIS },
                "tipo": if index % 3 == 0 { "RETIRO" } else { "DEPOSITO" },
                "monto": 10.0 + index as f64,
                "duracion_ms": 5.0 * (index + 1) as f64,
                "timestamp": format!("2024-05-01 12:00:{index:02}"),
                "status": if index == 6 { "error" } else { "ok" },
            })
        })
        .collect();
    ok(json!({ "operations": operations }))
}

async fn push_socket(ws: WebSocketUpgrade, State(bridge): State<FakeBridge>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_push(socket, bridge))
}

async fn serve_push(mut socket: WebSocket, bridge: FakeBridge) {
    bridge.inner.ws_connections.fetch_add(1, Ordering::SeqCst);
    let mut commands = bridge.inner.push.subscribe();
    let greeting = json!({ "event": "connected", "data": { "message": "Conectado al servidor" } });
    if socket
        .send(Message::Text(greeting.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => bridge.record_frame(&text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(PushCommand::Frame(frame)) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(PushCommand::Kick) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

pub async fn wait_until<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
