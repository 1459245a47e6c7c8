use std::sync::Arc;

use mongodb::Database;

use crate::{
    auth::JwtService,
    cqrs::{
        AddAddressCommandHandler, ConfirmPasswordResetCommandHandler, GetProfileQueryHandler,
        ListAddressesQueryHandler, LoginCommandHandler, LogoutCommandHandler, NearbyUsersQueryHandler,
        RefreshTokenCommandHandler, RegisterUserCommandHandler, RequestPasswordResetCommandHandler,
        UpdateProfileCommandHandler, VerifyEmailCommandHandler,
    },
    metrics::PrometheusMetricsService,
    uow::RepositoryContext,
};

pub struct AppState {
    pub register_user_command_handler: Arc<RegisterUserCommandHandler>,
    pub login_command_handler: Arc<LoginCommandHandler>,
    pub refresh_token_command_handler: Arc<RefreshTokenCommandHandler>,
    pub logout_command_handler: Arc<LogoutCommandHandler>,
    pub get_profile_query_handler: Arc<GetProfileQueryHandler>,
    pub update_profile_command_handler: Arc<UpdateProfileCommandHandler>,
    pub add_address_command_handler: Arc<AddAddressCommandHandler>,
    pub list_addresses_query_handler: Arc<ListAddressesQueryHandler>,
    pub nearby_users_query_handler: Arc<NearbyUsersQueryHandler>,
    pub verify_email_command_handler: Arc<VerifyEmailCommandHandler>,
    pub request_password_reset_command_handler: Arc<RequestPasswordResetCommandHandler>,
    pub confirm_password_reset_command_handler: Arc<ConfirmPasswordResetCommandHandler>,
    pub jwt_service: Arc<JwtService>,
    pub auth_metrics: Arc<PrometheusMetricsService>,
    /// Present when running against MongoDB, used by the health check.
    pub database: Option<Database>,
}

impl AppState {
    pub fn new(
        uow: Arc<RepositoryContext>,
        jwt_service: Arc<JwtService>,
        auth_metrics: Arc<PrometheusMetricsService>,
        database: Option<Database>,
    ) -> AppState {
        AppState {
            register_user_command_handler: Arc::new(RegisterUserCommandHandler::new(
                uow.clone(),
                jwt_service.clone(),
                auth_metrics.clone(),
            )),
            login_command_handler: Arc::new(LoginCommandHandler::new(
                uow.clone(),
                jwt_service.clone(),
                auth_metrics.clone(),
            )),
            refresh_token_command_handler: Arc::new(RefreshTokenCommandHandler::new(
                uow.clone(),
                jwt_service.clone(),
                auth_metrics.clone(),
            )),
            logout_command_handler: Arc::new(LogoutCommandHandler::new(uow.clone(), jwt_service.clone())),
            get_profile_query_handler: Arc::new(GetProfileQueryHandler::new(uow.clone())),
            update_profile_command_handler: Arc::new(UpdateProfileCommandHandler::new(uow.clone())),
            add_address_command_handler: Arc::new(AddAddressCommandHandler::new(uow.clone())),
            list_addresses_query_handler: Arc::new(ListAddressesQueryHandler::new(uow.clone())),
            nearby_users_query_handler: Arc::new(NearbyUsersQueryHandler::new(uow.clone())),
            verify_email_command_handler: Arc::new(VerifyEmailCommandHandler::new(uow.clone())),
            request_password_reset_command_handler: Arc::new(RequestPasswordResetCommandHandler::new(uow.clone())),
            confirm_password_reset_command_handler: Arc::new(ConfirmPasswordResetCommandHandler::new(uow)),
            jwt_service,
            auth_metrics,
            database,
        }
    }
}
